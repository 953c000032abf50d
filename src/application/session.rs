use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::domain::dashboard::{
    ActivityEntry, DashboardMetrics, ItemCounts, RatingStats, UserReview, build_dashboard_metrics,
    build_recent_activity, calculate_rating_stats, calculate_user_item_counts,
    collect_received_reviews,
};
use crate::domain::{
    self, AuthUser, BorrowRequest, BorrowSchedule, Decision, MarketplaceItem, QrCode,
    RatingContext, RatingDirection, RequestStatus, ScanError, ScanKind, ScheduleDraft,
    ScheduleEvent, SideEffect,
};
use crate::ports::{ChangeEvent, Table, TableStore};

use super::errors::{ErrorKind, LendingError, Result};
use super::inventory::ItemInventory;
use super::mapper::{BorrowDraft, ItemDraft};
use super::rating::RatingCoordinator;
use super::request_store::{self, BorrowRequestStore};
use super::schedule_store::{self, BorrowScheduleStore};
use super::ServiceDependencies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerTone {
    Success,
    Error,
    Info,
}

/// 閉じられる通知バナー
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub message: String,
    pub tone: BannerTone,
    pub kind: Option<ErrorKind>,
}

impl Banner {
    fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tone: BannerTone::Success,
            kind: None,
        }
    }

    fn error(error: &LendingError) -> Self {
        let kind = error.kind();
        Self {
            message: error.to_string(),
            tone: if kind == ErrorKind::Validation {
                BannerTone::Info
            } else {
                BannerTone::Error
            },
            kind: Some(kind),
        }
    }
}

/// スキャン・手動完了の結果
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub schedule: BorrowSchedule,
    /// 同期後のリクエスト
    pub request: Option<BorrowRequest>,
    /// 数量調整後の物品
    pub item: Option<MarketplaceItem>,
    /// 貸し手への評価の催促（返却時）
    pub rating_prompt: Option<RatingContext>,
    /// 失敗した副作用（ロールバックはしない）
    pub failed_effects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub metrics: DashboardMetrics,
    pub rating_stats: RatingStats,
    pub reviews: Vec<UserReview>,
    pub item_counts: ItemCounts,
    pub recent_activity: Vec<ActivityEntry>,
}

/// 1人の利用者のセッション
///
/// 各ストアを束ね、ストアをまたぐ副作用を調整する。
/// リモートの失敗はすべてバナーとして記録する。
pub struct LendingSession {
    viewer: AuthUser,
    table_store: Arc<dyn TableStore>,
    requests: BorrowRequestStore,
    schedules: BorrowScheduleStore,
    inventory: ItemInventory,
    ratings: RatingCoordinator,
    banner: Option<Banner>,
    scan_error: Option<String>,
    rating_prompt: Option<RatingContext>,
}

impl LendingSession {
    pub fn new(deps: ServiceDependencies, viewer: AuthUser) -> Self {
        Self {
            viewer,
            table_store: deps.table_store.clone(),
            requests: BorrowRequestStore::new(deps.clone()),
            schedules: BorrowScheduleStore::new(deps.clone()),
            inventory: ItemInventory::new(deps.clone()),
            ratings: RatingCoordinator::new(deps),
            banner: None,
            scan_error: None,
            rating_prompt: None,
        }
    }

    pub fn viewer(&self) -> &AuthUser {
        &self.viewer
    }

    pub fn requests(&self) -> &BorrowRequestStore {
        &self.requests
    }

    pub fn schedules(&self) -> &BorrowScheduleStore {
        &self.schedules
    }

    pub fn inventory(&self) -> &ItemInventory {
        &self.inventory
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    pub fn dismiss_banner(&mut self) {
        self.banner = None;
    }

    /// スキャナーに表示する不一致メッセージ
    pub fn scan_error(&self) -> Option<&str> {
        self.scan_error.as_deref()
    }

    /// スキャナーを閉じる
    pub fn close_scanner(&mut self) {
        self.scan_error = None;
    }

    pub fn rating_prompt(&self) -> Option<&RatingContext> {
        self.rating_prompt.as_ref()
    }

    pub fn close_rating_prompt(&mut self) {
        self.rating_prompt = None;
    }

    fn report<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.banner = Some(Banner::error(e));
        }
        result
    }

    /// リクエスト・スケジュール・出品物を読み込む
    ///
    /// どれかが失敗しても他は読み込む。最初のエラーを返す。
    pub async fn load(&mut self) -> Result<()> {
        let user_id = self.viewer.id.clone();
        let requests = self.requests.fetch_for_user(&user_id).await;
        let schedules = self.schedules.fetch_for_user(&user_id).await;
        let items = self.inventory.load().await;
        let result = requests.and(schedules).and(items);
        self.report(result)
    }

    // ------------------------------------------------------------------
    // ビュー
    // ------------------------------------------------------------------

    pub fn borrower_requests(&self) -> Vec<BorrowRequest> {
        self.requests.borrower_requests(&self.schedules.overrides())
    }

    pub fn lender_requests(&self) -> Vec<BorrowRequest> {
        self.requests.lender_requests(&self.schedules.overrides())
    }

    pub fn schedule_cards(&self) -> Vec<BorrowSchedule> {
        self.schedules.cards(self.requests.requests())
    }

    /// 閲覧者がこの物品に持つ進行中のリクエスト
    pub fn active_request_for_item(&self, item_id: &str) -> Option<BorrowRequest> {
        domain::active_requests_by_item(&self.borrower_requests()).remove(item_id)
    }

    pub fn dashboard(&self) -> DashboardView {
        let all = self.requests.requests();
        let borrower = self.borrower_requests();
        let lender = self.lender_requests();
        let user_id = self.viewer.id.as_str();
        let current_user = (!user_id.is_empty()).then_some(&self.viewer);
        let stats = calculate_rating_stats(all, user_id);

        DashboardView {
            metrics: build_dashboard_metrics(all, &borrower, &lender, current_user, &stats),
            rating_stats: stats,
            reviews: collect_received_reviews(all, user_id),
            item_counts: calculate_user_item_counts(all, user_id),
            recent_activity: build_recent_activity(&borrower, &lender, &[]),
        }
    }

    // ------------------------------------------------------------------
    // 出品
    // ------------------------------------------------------------------

    pub async fn list_item(&mut self, draft: &ItemDraft) -> Result<MarketplaceItem> {
        let result = if self.viewer.id.trim().is_empty() {
            Err(LendingError::NotSignedIn)
        } else {
            self.inventory.create(&self.viewer, draft).await
        };
        if result.is_ok() {
            self.banner = Some(Banner::success("Item listed successfully!"));
        }
        self.report(result)
    }

    pub async fn edit_item(
        &mut self,
        item_id: &str,
        draft: &ItemDraft,
    ) -> Result<MarketplaceItem> {
        let result = self.inventory.update(&self.viewer, item_id, draft).await;
        if result.is_ok() {
            self.banner = Some(Banner::success("Item updated successfully!"));
        }
        self.report(result)
    }

    pub async fn remove_item(&mut self, item_id: &str) -> Result<MarketplaceItem> {
        let result = self.inventory.delete(&self.viewer, item_id).await;
        if let Ok(removed) = &result {
            self.banner = Some(Banner::success(format!(
                "Listing for \"{}\" deleted.",
                removed.title
            )));
        }
        self.report(result)
    }

    // ------------------------------------------------------------------
    // リクエスト
    // ------------------------------------------------------------------

    pub async fn submit_request(&mut self, draft: &BorrowDraft) -> Result<BorrowRequest> {
        let result = self.try_submit_request(draft).await;
        if let Ok(created) = &result {
            let on = created
                .preferred_date
                .map(|d| d.to_string())
                .unwrap_or_default();
            self.banner = Some(Banner::success(format!(
                "Request submitted for {} on {}.",
                created.item_title, on
            )));
        }
        self.report(result)
    }

    async fn try_submit_request(&mut self, draft: &BorrowDraft) -> Result<BorrowRequest> {
        let item = match self.inventory.get(&draft.item_id).cloned() {
            Some(item) => item,
            None => self.inventory.fetch(&draft.item_id).await?,
        };
        self.requests.submit(&self.viewer, &item, draft).await
    }

    pub async fn decide(
        &mut self,
        request_id: &str,
        decision: Decision,
        message: Option<&str>,
    ) -> Result<BorrowRequest> {
        let result = self
            .requests
            .decide(&self.viewer, request_id, decision, message)
            .await;
        if let Ok(updated) = &result {
            let verb = match decision {
                Decision::Approve => "approved",
                Decision::Reject => "rejected",
            };
            self.banner = Some(Banner::success(format!(
                "Request for {} {}.",
                updated.item_title, verb
            )));
        }
        self.report(result)
    }

    /// 貸し手が手動でリクエストを完了にする
    pub async fn complete_request(&mut self, request_id: &str) -> Result<BorrowRequest> {
        let result = self.try_complete_request(request_id).await;
        self.report(result)
    }

    async fn try_complete_request(&mut self, request_id: &str) -> Result<BorrowRequest> {
        let request = self
            .requests
            .get(request_id)
            .ok_or(LendingError::RequestNotFound)?;
        if !self
            .viewer
            .matches(request.owner_id.as_deref(), &request.lender_name)
        {
            return Err(LendingError::Validation(
                "Only the lender can complete this request".to_string(),
            ));
        }
        let id = request.id.clone();
        self.requests.complete(&id).await
    }

    // ------------------------------------------------------------------
    // スケジュールとQR
    // ------------------------------------------------------------------

    /// 受け渡しを手配し、在庫を1つ減らす
    pub async fn arrange_schedule(
        &mut self,
        request_id: &str,
        draft: &ScheduleDraft,
    ) -> Result<BorrowSchedule> {
        let result = self.try_arrange_schedule(request_id, draft).await;
        if result.is_ok() {
            self.banner = Some(Banner::success("Schedule created successfully!"));
        }
        self.report(result)
    }

    async fn try_arrange_schedule(
        &mut self,
        request_id: &str,
        draft: &ScheduleDraft,
    ) -> Result<BorrowSchedule> {
        let request = self
            .requests
            .get(request_id)
            .cloned()
            .ok_or(LendingError::RequestNotFound)?;
        let schedule = self
            .schedules
            .create(&request, &self.viewer, draft, Utc::now())
            .await?;

        if !schedule.item_id.is_empty() {
            if let Err(e) = self.inventory.adjust_quantity(&schedule.item_id, -1).await {
                tracing::error!(schedule_id = %schedule.id, item_id = %schedule.item_id, error = %e, "Failed to reserve item quantity");
            }
        }
        Ok(schedule)
    }

    /// 借り手が提示する受け渡し用QR
    pub fn handoff_qr(&mut self, schedule_id: &str) -> Result<QrCode> {
        let result = match self.schedules.get(schedule_id) {
            Some(schedule) => {
                domain::present_handoff_qr(schedule, &self.viewer).map_err(LendingError::from)
            }
            None => Err(LendingError::ScheduleNotFound),
        };
        self.report(result)
    }

    /// 貸し手が返却用QRを発行する
    pub async fn generate_return_qr(&mut self, schedule_id: &str) -> Result<QrCode> {
        let result = self
            .schedules
            .generate_return_qr(schedule_id, &self.viewer, Utc::now())
            .await
            .map(|schedule| schedule.lender_qr_code);
        self.report(result)
    }

    /// QRスキャンを処理する
    ///
    /// 一致すれば状態をローカルで確定し、副作用をそれぞれ独立に実行する。
    /// 不一致ならスケジュールは変えず、スキャナー用のメッセージを設定する。
    pub async fn scan(
        &mut self,
        schedule_id: &str,
        kind: ScanKind,
        payload: &str,
    ) -> Result<ScanReport> {
        self.scan_error = None;

        let Some(schedule) = self.schedules.get(schedule_id).cloned() else {
            return self.report(Err(LendingError::ScheduleNotFound));
        };
        let schedule = self.link_request(schedule);

        let (updated, event) =
            match domain::scan(&schedule, &self.viewer, kind, payload, Utc::now()) {
                Ok(outcome) => outcome,
                Err(e @ ScanError::Mismatch(_)) => {
                    tracing::debug!(schedule_id = %schedule_id, kind = kind.as_str(), "Scanned code rejected");
                    self.scan_error = Some(e.to_string());
                    return Err(e.into());
                }
                Err(e) => return self.report(Err(e.into())),
            };

        tracing::info!(schedule_id = %updated.id, status = updated.status.as_str(), "Schedule advanced by scan");
        self.schedules.commit_local(updated.clone());
        let report = self.run_effects(updated, &event).await;

        let message = match kind {
            ScanKind::Handoff => format!(
                "Handoff confirmed for {}. Status updated to Borrowed.",
                report.schedule.item_title
            ),
            ScanKind::Return => format!(
                "Item return confirmed. Transaction completed with {}.",
                report.schedule.borrower_name
            ),
        };
        self.banner = Some(Banner::success(message));
        Ok(report)
    }

    /// 貸し手が手動で返却完了にする
    pub async fn mark_schedule_complete(&mut self, schedule_id: &str) -> Result<ScanReport> {
        let Some(schedule) = self.schedules.get(schedule_id).cloned() else {
            return self.report(Err(LendingError::ScheduleNotFound));
        };
        let schedule = self.link_request(schedule);

        let (updated, event) = match domain::mark_complete(&schedule, &self.viewer, Utc::now()) {
            Ok(outcome) => outcome,
            Err(e) => return self.report(Err(e.into())),
        };

        tracing::info!(schedule_id = %updated.id, "Schedule marked complete");
        self.schedules.commit_local(updated.clone());
        let report = self.run_effects(updated, &event).await;
        self.banner = Some(Banner::success(format!(
            "Borrowing of {} marked complete.",
            report.schedule.item_title
        )));
        Ok(report)
    }

    /// リクエストIDを持たない旧データは、物品と借り手名でリクエストを探す
    fn link_request(&self, mut schedule: BorrowSchedule) -> BorrowSchedule {
        if schedule.request_id.is_none() {
            schedule.request_id = self
                .requests
                .requests()
                .iter()
                .find(|req| {
                    req.item_id == schedule.item_id && req.borrower_name == schedule.borrower_name
                })
                .map(|req| req.id.clone());
        }
        schedule
    }

    async fn run_effects(&mut self, schedule: BorrowSchedule, event: &ScheduleEvent) -> ScanReport {
        let mut report = ScanReport {
            schedule,
            request: None,
            item: None,
            rating_prompt: None,
            failed_effects: Vec::new(),
        };

        for effect in event.effects() {
            match effect {
                SideEffect::PersistSchedule => {
                    if let Err(e) = self.schedules.persist_state(&report.schedule).await {
                        report.failed_effects.push(format!("persist schedule: {}", e));
                    }
                }
                SideEffect::SyncRequest { request_id, target } => {
                    match self.requests.advance_to(&request_id, target).await {
                        Ok(request) => report.request = Some(request),
                        Err(e) => {
                            tracing::error!(request_id = %request_id, target = target.as_str(), error = %e, "Failed to sync borrow request");
                            report.failed_effects.push(format!("sync request: {}", e));
                        }
                    }
                }
                SideEffect::AdjustQuantity { item_id, delta } => {
                    match self.inventory.adjust_quantity(&item_id, delta).await {
                        Ok(item) => report.item = Some(item),
                        Err(e) => report.failed_effects.push(format!("adjust quantity: {}", e)),
                    }
                }
                SideEffect::PromptLenderRating { request_id } => {
                    if let Some(request) = self.requests.get(&request_id) {
                        let context =
                            RatingContext::for_request(request, RatingDirection::LenderToBorrower);
                        self.rating_prompt = Some(context.clone());
                        report.rating_prompt = Some(context);
                    }
                }
            }
        }

        report
    }

    // ------------------------------------------------------------------
    // 評価
    // ------------------------------------------------------------------

    /// 評価の入力を開く（既存の評価があれば初期値として含む）
    pub fn open_rating(
        &mut self,
        request_id: &str,
        direction: RatingDirection,
    ) -> Result<RatingContext> {
        let result = self.try_open_rating(request_id, direction);
        if let Ok(context) = &result {
            self.rating_prompt = Some(context.clone());
        }
        self.report(result)
    }

    fn try_open_rating(
        &self,
        request_id: &str,
        direction: RatingDirection,
    ) -> Result<RatingContext> {
        let request = self
            .requests
            .get(request_id)
            .ok_or(LendingError::RequestNotFound)?;
        let is_rater = match direction {
            RatingDirection::BorrowerToLender => self
                .viewer
                .matches(Some(&request.borrower_id), &request.borrower_name),
            RatingDirection::LenderToBorrower => self
                .viewer
                .matches(request.owner_id.as_deref(), &request.lender_name),
        };
        if !is_rater {
            return Err(LendingError::Validation(
                "You can only rate borrowings you took part in".to_string(),
            ));
        }
        let effective = self
            .schedules
            .overrides()
            .get(&request.id)
            .copied()
            .unwrap_or(request.status);
        if effective != RequestStatus::Completed {
            return Err(LendingError::Validation(
                "Feedback is available once the borrowing is completed".to_string(),
            ));
        }
        Ok(RatingContext::for_request(request, direction))
    }

    /// 評価を送信する
    ///
    /// 確認済みの行を既知の識別子に一致するすべてのローカル行に反映し、
    /// 評価された側のプロフィール評価を更新する。
    pub async fn submit_rating(
        &mut self,
        context: &RatingContext,
        rating: i64,
        review: &str,
    ) -> Result<BorrowRequest> {
        let result = self.ratings.submit(context, rating, review, Utc::now()).await;
        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(e) => return self.report(Err(e)),
        };

        let mut known_ids = vec![context.request_id.clone(), confirmed.id.clone()];
        known_ids.extend(context.raw_keys.texts());
        known_ids.extend(confirmed.raw_keys.texts());
        self.requests.merge_confirmed(confirmed.clone(), &known_ids);

        self.rating_prompt = None;
        self.banner = Some(Banner::success("Rating submitted successfully!"));

        if let Some(target) = context.target_user_id.as_deref() {
            self.ratings.refresh_profile_rating(target).await;
        }
        Ok(confirmed)
    }

    // ------------------------------------------------------------------
    // リアルタイム
    // ------------------------------------------------------------------

    /// 関係するテーブルの変更通知をまとめて購読する
    pub async fn subscribe(&self) -> Result<BoxStream<'static, ChangeEvent>> {
        let user_id = self.viewer.id.as_str();
        let subscribe = |table: Table, filter| {
            let store = self.table_store.clone();
            async move {
                store.subscribe(table, filter).await.map_err(|e| {
                    tracing::error!(table = table.as_str(), error = %e, "Failed to subscribe to changes");
                    LendingError::remote("Failed to subscribe to live updates", e)
                })
            }
        };

        let streams = vec![
            subscribe(
                Table::BorrowRequests,
                Some(request_store::participant_filter(user_id)),
            )
            .await?,
            subscribe(
                Table::BorrowSchedules,
                Some(schedule_store::participant_filter(user_id)),
            )
            .await?,
            subscribe(Table::Items, None).await?,
        ];
        Ok(futures::stream::select_all(streams).boxed())
    }

    /// 変更通知を所有するストアに振り分ける
    pub fn apply_change(&mut self, event: &ChangeEvent) {
        match event.table {
            Table::BorrowRequests => self.requests.apply_realtime_change(event),
            Table::BorrowSchedules => self.schedules.apply_realtime_change(event),
            Table::Items => self.inventory.apply_realtime_change(event),
            Table::Profiles => {}
        }
    }

    /// 以降の変更通知を無視する
    pub fn close(&mut self) {
        self.requests.close();
        self.schedules.close();
        self.inventory.close();
    }
}
