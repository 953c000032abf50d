use crate::application::{
    BorrowDraft, DashboardView, ItemDraft, LendingError, LendingSession, ScanReport,
    ServiceDependencies,
};
use crate::domain::{AuthUser, BorrowRequest, BorrowSchedule, MarketplaceItem};
use axum::{
    Json, async_trait,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
};
use std::sync::Arc;

use super::{
    error::ApiError,
    types::{
        CreateScheduleRequest, DecisionRequest, FeedbackRequest, QrResponse, RequestListResponse,
        ScanRequest,
    },
};

// ============================================================================
// State
// ============================================================================

/// ハンドラー間で共有されるアプリケーション状態
#[derive(Clone)]
pub struct AppState {
    pub service_deps: ServiceDependencies,
}

// ============================================================================
// Viewer
// ============================================================================

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_RATING_HEADER: &str = "x-user-rating";

/// 認証ゲートウェイが付与したヘッダーから得た利用者
#[derive(Debug, Clone)]
pub struct Viewer(pub AuthUser);

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for Viewer
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, USER_ID_HEADER).ok_or(LendingError::NotSignedIn)?;
        let email = header(parts, USER_EMAIL_HEADER);
        // 名前がなければメールアドレスのローカル部を使う
        let name = header(parts, USER_NAME_HEADER)
            .or_else(|| {
                email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "User".to_string());

        let mut user = AuthUser::new(id, name);
        user.email = email;
        user.rating = header(parts, USER_RATING_HEADER)
            .and_then(|r| r.parse::<f64>().ok())
            .filter(|r| r.is_finite())
            .unwrap_or_default();
        Ok(Viewer(user))
    }
}

/// 利用者のセッションを開いてデータを読み込む
async fn open_session(state: &AppState, viewer: AuthUser) -> Result<LendingSession, ApiError> {
    let mut session = LendingSession::new(state.service_deps.clone(), viewer);
    session.load().await?;
    Ok(session)
}

// ============================================================================
// Items
// ============================================================================

/// GET /items - 出品物一覧（新しい順）
pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
) -> Result<Json<Vec<MarketplaceItem>>, ApiError> {
    let session = open_session(&state, viewer).await?;
    Ok(Json(session.inventory().items().to_vec()))
}

/// POST /items - 出品する
///
/// 強制されるビジネスルール:
/// - タイトルが必須
/// - 数量が0以下・数値でなければ1
pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Json(draft): Json<ItemDraft>,
) -> Result<(StatusCode, Json<MarketplaceItem>), ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let created = session.list_item(&draft).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /items/:id - 出品を編集（所有者のみ）
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(item_id): Path<String>,
    Json(draft): Json<ItemDraft>,
) -> Result<Json<MarketplaceItem>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let updated = session.edit_item(&item_id, &draft).await?;
    Ok(Json(updated))
}

/// DELETE /items/:id - 出品を削除（所有者のみ）
pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(item_id): Path<String>,
) -> Result<Json<MarketplaceItem>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let removed = session.remove_item(&item_id).await?;
    Ok(Json(removed))
}

// ============================================================================
// Requests
// ============================================================================

/// GET /requests - 借り手・貸し手としてのリクエスト一覧
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
) -> Result<Json<RequestListResponse>, ApiError> {
    let session = open_session(&state, viewer).await?;
    Ok(Json(RequestListResponse {
        as_borrower: session.borrower_requests(),
        as_lender: session.lender_requests(),
        pending_count: session.requests().pending_count(),
    }))
}

/// POST /requests - 借りるリクエストを送信
///
/// 強制されるビジネスルール:
/// - 自分の物品・在庫0の物品は借りられない
/// - 同じ物品に進行中のリクエストがあれば拒否
/// - 日付・待ち合わせ場所・時刻が必須
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Json(draft): Json<BorrowDraft>,
) -> Result<(StatusCode, Json<BorrowRequest>), ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let created = session.submit_request(&draft).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /requests/:id/decision - 貸し手が承認・却下
pub async fn decide_request(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(request_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<BorrowRequest>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let updated = session
        .decide(&request_id, req.decision, req.message.as_deref())
        .await?;
    Ok(Json(updated))
}

/// POST /requests/:id/complete - 貸し手が手動で完了にする
pub async fn complete_request(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(request_id): Path<String>,
) -> Result<Json<BorrowRequest>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let updated = session.complete_request(&request_id).await?;
    Ok(Json(updated))
}

/// POST /requests/:id/feedback - 完了した貸出を評価
///
/// 同じ方向の再送信は既存の評価を上書きする。
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(request_id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<BorrowRequest>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let context = session.open_rating(&request_id, req.direction)?;
    let updated = session
        .submit_rating(&context, req.rating, &req.review)
        .await?;
    Ok(Json(updated))
}

// ============================================================================
// Schedules
// ============================================================================

/// GET /schedules - スケジュールカード一覧（未手配の承認済みリクエストを含む）
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
) -> Result<Json<Vec<BorrowSchedule>>, ApiError> {
    let session = open_session(&state, viewer).await?;
    Ok(Json(session.schedule_cards()))
}

/// POST /schedules - 承認済みリクエストの受け渡しを手配
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<BorrowSchedule>), ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let schedule = session
        .arrange_schedule(&req.request_id, &req.to_draft())
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /schedules/:id/handoff-qr - 借り手の受け渡し用QR
pub async fn handoff_qr(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(schedule_id): Path<String>,
) -> Result<Json<QrResponse>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let code = session.handoff_qr(&schedule_id)?;
    Ok(Json(QrResponse { schedule_id, code }))
}

/// POST /schedules/:id/return-qr - 貸し手が返却用QRを発行
pub async fn return_qr(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(schedule_id): Path<String>,
) -> Result<Json<QrResponse>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let code = session.generate_return_qr(&schedule_id).await?;
    Ok(Json(QrResponse { schedule_id, code }))
}

/// POST /schedules/:id/scan - QRスキャンで受け渡し・返却を確定
pub async fn scan(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(schedule_id): Path<String>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanReport>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let report = session.scan(&schedule_id, req.kind, &req.payload).await?;
    Ok(Json(report))
}

/// POST /schedules/:id/complete - 貸し手が手動で返却完了にする
pub async fn complete_schedule(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
    Path(schedule_id): Path<String>,
) -> Result<Json<ScanReport>, ApiError> {
    let mut session = open_session(&state, viewer).await?;
    let report = session.mark_schedule_complete(&schedule_id).await?;
    Ok(Json(report))
}

// ============================================================================
// Dashboard
// ============================================================================

/// GET /dashboard - 指標・評価・最近の活動
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Viewer(viewer): Viewer,
) -> Result<Json<DashboardView>, ApiError> {
    let session = open_session(&state, viewer).await?;
    Ok(Json(session.dashboard()))
}
