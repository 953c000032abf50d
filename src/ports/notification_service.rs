use async_trait::async_trait;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// 通知の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// 貸し手への新規リクエスト通知
    BorrowRequest,
    /// 借り手への承認通知
    Approval,
    /// 借り手への却下通知
    Rejection,
}

/// 通知の内容
///
/// 外部の通知関数にそのまま渡せるよう camelCase でシリアライズする。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// 宛先メールアドレス
    pub email: String,
    pub item_title: String,
    pub borrower_name: String,
    pub lender_name: String,
    pub preferred_date: String,
    pub return_date: Option<String>,
    pub meeting_place: Option<String>,
    pub meeting_time: Option<String>,
    /// 借り手のメッセージ（新規リクエスト時）
    pub message: Option<String>,
    /// 貸し手の判断メッセージ（承認・却下時）
    pub decision_message: Option<String>,
    pub notification_type: NotificationKind,
}

/// 通知サービスポート
///
/// メールなどの配信手段を抽象化する。
/// 呼び出し側は失敗をログに残すだけで、業務処理は継続する。
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}
