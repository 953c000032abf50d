use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{BorrowRequest, Decision, QrCode, RatingDirection, ScanKind, ScheduleDraft};

/// リクエスト一覧（GET /requests）
#[derive(Debug, Serialize)]
pub struct RequestListResponse {
    /// 借り手としてのリクエスト（スケジュールの進行を反映済み）
    pub as_borrower: Vec<BorrowRequest>,
    /// 貸し手としてのリクエスト（スケジュールの進行を反映済み）
    pub as_lender: Vec<BorrowRequest>,
    pub pending_count: usize,
}

/// 承認・却下（POST /requests/:id/decision）
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
    #[serde(default)]
    pub message: Option<String>,
}

/// 評価の送信（POST /requests/:id/feedback）
#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub direction: RatingDirection,
    pub rating: i64,
    #[serde(default)]
    pub review: String,
}

/// 受け渡しの手配（POST /schedules）
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub request_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub meeting_place: String,
    #[serde(default)]
    pub meeting_time: String,
}

impl CreateScheduleRequest {
    pub fn to_draft(&self) -> ScheduleDraft {
        ScheduleDraft {
            start_date: self.start_date,
            end_date: self.end_date,
            meeting_place: self.meeting_place.clone(),
            meeting_time: self.meeting_time.clone(),
        }
    }
}

/// スキャン結果（POST /schedules/:id/scan）
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub kind: ScanKind,
    pub payload: String,
}

/// QRコード（GET /schedules/:id/handoff-qr と POST /schedules/:id/return-qr）
#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub schedule_id: String,
    pub code: QrCode,
}

/// エラーレスポンス
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
