use thiserror::Error;

use super::{RequestStatus, Role, ScanKind, ScheduleStatus};

/// 貸出リクエストの状態遷移エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot move a {} request to {}", .from.as_str(), .to.as_str())]
pub struct TransitionError {
    pub from: RequestStatus,
    pub to: RequestStatus,
}

/// スケジュール操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// 操作できるのは特定の役割のみ
    #[error("Only the {} can do this", .required.as_str())]
    NotPermitted { required: Role },
    /// 現在の状態では実行できない
    #[error("This action is not available while the schedule is {}", .status.as_str())]
    InvalidState { status: ScheduleStatus },
    /// 承認済みでないリクエストにはスケジュールを作れない
    #[error("Only approved requests can be scheduled")]
    RequestNotApproved,
    /// 開始日または終了日が未入力
    #[error("Please select both start and end dates")]
    MissingDates,
    /// 終了日が開始日より前
    #[error("End date must be on or after the start date")]
    EndBeforeStart,
    /// 受け渡し場所が未入力
    #[error("Please provide a meeting place")]
    MissingMeetingPlace,
    /// 受け渡し時刻が未入力
    #[error("Please select a meeting time")]
    MissingMeetingTime,
}

/// QRスキャンのエラー
///
/// いずれの場合もスケジュールは変更されない。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// スキャンしたコードが期待値と一致しない
    #[error("{}", mismatch_message(.0))]
    Mismatch(ScanKind),
    /// このスキャンを行える役割ではない
    #[error("Only the {} can scan this code", .required.as_str())]
    WrongRole { required: Role },
    /// スケジュールがこのスキャンを受け付ける状態ではない
    #[error("This schedule is not ready for a {} scan", .kind.as_str())]
    NotReady { kind: ScanKind },
}

fn mismatch_message(kind: &ScanKind) -> &'static str {
    match kind {
        ScanKind::Handoff => "Scanned code does not match the borrower's QR. Please try again.",
        ScanKind::Return => {
            "Scanned code does not match the lender's return QR. Please try again."
        }
    }
}

/// 評価のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatingError {
    /// 評価値が1〜5の範囲外
    #[error("Rating must be between 1 and 5 stars (got {0})")]
    OutOfRange(i64),
}
