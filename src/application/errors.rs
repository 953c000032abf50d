use serde::Serialize;
use thiserror::Error;

use crate::domain::{RatingError, ScanError, ScheduleError, TransitionError};
use crate::ports::StoreError;

pub const DUPLICATE_ACTIVE_REQUEST: &str =
    "You already have an active request for this item. Please wait for the lender to respond.";
pub const REFRESH_AND_RETRY: &str = "We couldn't update that request. Please refresh and try again.";

/// エラーの分類
///
/// 呼び出し側（API・バナー表示）はこの分類で扱いを決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 入力・状態の検証エラー（リモート呼び出しなし）
    Validation,
    /// 永続化層のエラー
    Remote,
    /// 識別子を解決できなかった（再読み込みで解消しうる）
    Retryable,
    /// スキャンしたコードの不一致
    ScanMismatch,
    NotFound,
}

/// 貸出アプリケーション層のエラー
#[derive(Debug, Error)]
pub enum LendingError {
    /// サインインしていない
    #[error("Please sign in to continue")]
    NotSignedIn,

    /// 同じ物品に進行中のリクエストがある
    #[error("{}", DUPLICATE_ACTIVE_REQUEST)]
    DuplicateActiveRequest,

    /// 自分の物品は借りられない
    #[error("You can't borrow your own item")]
    OwnItem,

    /// 在庫がない
    #[error("This item is currently unavailable")]
    ItemUnavailable,

    /// その他の入力エラー
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Rating(#[from] RatingError),

    #[error("Borrow request not found")]
    RequestNotFound,

    #[error("Schedule not found")]
    ScheduleNotFound,

    #[error("Item not found")]
    ItemNotFound,

    /// どの識別子でも対象の行を特定できなかった
    #[error("{}", REFRESH_AND_RETRY)]
    Unresolved,

    /// 永続化層のエラー（利用者向けメッセージ付き）
    #[error("{message}")]
    Remote {
        message: String,
        #[source]
        source: StoreError,
    },
}

impl LendingError {
    pub fn remote(message: impl Into<String>, source: StoreError) -> Self {
        LendingError::Remote {
            message: message.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LendingError::Scan(ScanError::Mismatch(_)) => ErrorKind::ScanMismatch,
            LendingError::RequestNotFound
            | LendingError::ScheduleNotFound
            | LendingError::ItemNotFound => ErrorKind::NotFound,
            LendingError::Unresolved => ErrorKind::Retryable,
            LendingError::Remote { .. } => ErrorKind::Remote,
            LendingError::NotSignedIn
            | LendingError::DuplicateActiveRequest
            | LendingError::OwnItem
            | LendingError::ItemUnavailable
            | LendingError::Validation(_)
            | LendingError::Transition(_)
            | LendingError::Schedule(_)
            | LendingError::Scan(_)
            | LendingError::Rating(_) => ErrorKind::Validation,
        }
    }
}

/// アプリケーション層の Result型
pub type Result<T> = std::result::Result<T, LendingError>;
