use std::collections::HashMap;

use chrono::Utc;

use crate::domain::{
    self, AuthUser, BorrowRequest, Decision, MarketplaceItem, RequestStatus, ensure_transition,
};
use crate::ports::{ChangeEvent, ChangeKind, Filter, Notification, NotificationKind, Query, Table};

use super::errors::{LendingError, Result};
use super::mapper::{self, BorrowDraft};
use super::ServiceDependencies;

/// 貸出リクエストのストア
///
/// 現在のユーザーが借り手または貸し手として関わるリクエストを保持する。
/// ローカルの状態はリモートの確認後にのみ更新する。
pub struct BorrowRequestStore {
    deps: ServiceDependencies,
    user_id: Option<String>,
    requests: Vec<BorrowRequest>,
    live: bool,
    last_error: Option<String>,
}

/// 入力内容を検証する（リモート呼び出し前）
pub fn validate_draft(draft: &BorrowDraft) -> Result<()> {
    let Some(preferred) = draft.preferred_date else {
        return Err(LendingError::Validation(
            "Please select a preferred start date".to_string(),
        ));
    };
    let Some(return_date) = draft.return_date else {
        return Err(LendingError::Validation(
            "Please select a return date".to_string(),
        ));
    };
    if return_date < preferred {
        return Err(LendingError::Validation(
            "Return date must be on or after the preferred start date".to_string(),
        ));
    }
    if draft.meeting_place.as_deref().is_none_or(|p| p.trim().is_empty()) {
        return Err(LendingError::Validation(
            "Please provide a meeting place".to_string(),
        ));
    }
    if draft.meeting_time.as_deref().is_none_or(|t| t.trim().is_empty()) {
        return Err(LendingError::Validation(
            "Please choose a meeting time".to_string(),
        ));
    }
    Ok(())
}

/// ユーザーが借り手または貸し手である行の条件
pub fn participant_filter(user_id: &str) -> Filter {
    Filter::or([
        Filter::eq("borrower_id", user_id),
        Filter::eq("owner_id", user_id),
    ])
}

impl BorrowRequestStore {
    pub fn new(deps: ServiceDependencies) -> Self {
        Self {
            deps,
            user_id: None,
            requests: Vec::new(),
            live: true,
            last_error: None,
        }
    }

    pub fn requests(&self) -> &[BorrowRequest] {
        &self.requests
    }

    /// ローカルIDまたは生キーで検索する
    pub fn get(&self, id: &str) -> Option<&BorrowRequest> {
        self.requests
            .iter()
            .find(|req| req.id == id)
            .or_else(|| self.requests.iter().find(|req| req.is_identified_by(id)))
    }

    /// 直近の送信エラー（次の成功でクリアされる）
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// 以降のリアルタイムイベントを無視する
    pub fn close(&mut self) {
        self.live = false;
    }

    /// ユーザーのリクエストを取得する（新しい順）
    ///
    /// ユーザーIDが空ならリモートを呼ばずに空にする。
    /// 失敗時は直前の状態を保つ。
    pub async fn fetch_for_user(&mut self, user_id: &str) -> Result<()> {
        if user_id.is_empty() {
            self.user_id = None;
            self.requests.clear();
            return Ok(());
        }

        let query = Query::new()
            .filter(participant_filter(user_id))
            .order_by("created_at", false);
        let rows = self
            .deps
            .table_store
            .select(Table::BorrowRequests, query)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Failed to load borrow requests");
                LendingError::remote("Failed to load borrow requests", e)
            })?;

        let now = Utc::now();
        let mut mapped: Vec<BorrowRequest> = rows
            .iter()
            .map(|row| mapper::map_borrow_request(row, now))
            .collect();
        domain::sort_newest_first(&mut mapped);

        self.user_id = Some(user_id.to_string());
        self.requests = mapped;
        Ok(())
    }

    /// リアルタイムの変更を反映する（冪等）
    pub fn apply_realtime_change(&mut self, event: &ChangeEvent) {
        if !self.live || event.table != Table::BorrowRequests {
            return;
        }

        match event.kind {
            ChangeKind::Delete => {
                let Some(old) = &event.old else {
                    return;
                };
                let removed = ["id", "uuid"]
                    .iter()
                    .filter_map(|key| old.get(*key))
                    .find_map(crate::ports::table_store::value_text);
                if let Some(removed) = removed {
                    self.requests.retain(|req| req.id != removed);
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(new) = &event.new else {
                    return;
                };
                let mapped = mapper::map_borrow_request(new, Utc::now());
                self.upsert(mapped);
            }
        }
    }

    /// IDが一致すれば置き換え、なければ先頭に追加してから並べ直す
    pub fn upsert(&mut self, request: BorrowRequest) {
        match self.requests.iter_mut().find(|req| req.id == request.id) {
            Some(existing) => *existing = request,
            None => self.requests.insert(0, request),
        }
        domain::sort_newest_first(&mut self.requests);
    }

    /// 確認済みの行を、既知の識別子のいずれかに一致するすべてのローカル行に反映する
    pub fn merge_confirmed(&mut self, confirmed: BorrowRequest, known_ids: &[String]) {
        let mut merged = false;
        for req in self.requests.iter_mut() {
            let matches = known_ids
                .iter()
                .any(|id| req.id == *id || req.raw_keys.matches(id));
            if matches {
                *req = confirmed.clone();
                merged = true;
            }
        }
        if merged {
            // 同じ行を指していた重複を1件にまとめる
            let mut seen = std::collections::HashSet::new();
            self.requests.retain(|req| seen.insert(req.id.clone()));
            domain::sort_newest_first(&mut self.requests);
        } else {
            self.upsert(confirmed);
        }
    }

    /// 借りるリクエストを送信する
    ///
    /// ビジネスルール：
    /// - 自分の物品、在庫0の物品は借りられない
    /// - 同じ物品に進行中のリクエストがあれば、リモートを呼ばずに拒否する
    /// - 貸し手のメールアドレスが不明なら物品の行から補う
    /// - 成功したら貸し手に通知する（失敗しても送信は成功扱い）
    pub async fn submit(
        &mut self,
        viewer: &AuthUser,
        item: &MarketplaceItem,
        draft: &BorrowDraft,
    ) -> Result<BorrowRequest> {
        if viewer.id.trim().is_empty() {
            return Err(LendingError::NotSignedIn);
        }
        let checks = if item.is_owned_by(&viewer.id) {
            Err(LendingError::OwnItem)
        } else if !item.is_available() {
            Err(LendingError::ItemUnavailable)
        } else if domain::has_active_request(&self.requests, &item.id, &viewer.id) {
            Err(LendingError::DuplicateActiveRequest)
        } else {
            validate_draft(draft)
        };
        if let Err(e) = checks {
            self.last_error = Some(e.to_string());
            return Err(e);
        }

        let lender_email = match item.lender.email.clone().filter(|e| !e.is_empty()) {
            Some(email) => Some(email),
            None => self.lookup_lender_email(&item.id).await,
        };

        let record = mapper::new_request_record(item, viewer, draft, lender_email.as_deref());
        let inserted = match self
            .deps
            .table_store
            .insert(Table::BorrowRequests, record)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(item_id = %item.id, error = %e, "Failed to submit borrow request");
                let error = LendingError::remote("Failed to submit request. Please try again.", e);
                self.last_error = Some(error.to_string());
                return Err(error);
            }
        };

        let mut created = mapper::map_borrow_request(&inserted, Utc::now());
        if created.lender_email.is_none() {
            created.lender_email = lender_email;
        }
        self.requests.retain(|req| req.id != created.id);
        self.requests.insert(0, created.clone());
        self.last_error = None;
        tracing::info!(request_id = %created.id, item_id = %created.item_id, "Borrow request submitted");

        if let Some(email) = created.lender_email.clone() {
            self.notify(Notification {
                email,
                item_title: created.item_title.clone(),
                borrower_name: created.borrower_name.clone(),
                lender_name: created.lender_name.clone(),
                preferred_date: date_text(created.preferred_date),
                return_date: created.return_date.map(|d| d.to_string()),
                meeting_place: created.meeting_place.clone(),
                meeting_time: created.meeting_time.clone(),
                message: Some(created.message.clone()),
                decision_message: None,
                notification_type: NotificationKind::BorrowRequest,
            })
            .await;
        }

        Ok(created)
    }

    async fn lookup_lender_email(&self, item_id: &str) -> Option<String> {
        let query = Query::new()
            .filter(Filter::eq("id", mapper::id_value(item_id)))
            .limit(1);
        match self.deps.table_store.select(Table::Items, query).await {
            Ok(rows) => rows.first().and_then(mapper::lender_email_of),
            Err(e) => {
                tracing::error!(item_id = %item_id, error = %e, "Failed to look up lender email");
                None
            }
        }
    }

    /// 貸し手が承認・却下する
    ///
    /// `pending` のリクエストのみ。リモートが行を返した後にのみローカルを更新する。
    pub async fn decide(
        &mut self,
        viewer: &AuthUser,
        request_id: &str,
        decision: Decision,
        message: Option<&str>,
    ) -> Result<BorrowRequest> {
        let current = self
            .get(request_id)
            .cloned()
            .ok_or(LendingError::RequestNotFound)?;
        if !viewer.matches(current.owner_id.as_deref(), &current.lender_name) {
            return Err(LendingError::Validation(
                "Only the lender can respond to this request".to_string(),
            ));
        }
        let target = decision.target_status();
        ensure_transition(current.status, target)?;

        let message = message.map(str::trim).filter(|m| !m.is_empty());
        let failure = match decision {
            Decision::Approve => "Failed to approve the request. Please try again.",
            Decision::Reject => "Failed to reject the request. Please try again.",
        };
        let updated = self
            .persist(&current, mapper::decision_changes(target, message), failure)
            .await?;
        tracing::info!(request_id = %updated.id, status = updated.status.as_str(), "Borrow request decided");

        if !updated.borrower_email.is_empty() {
            let kind = match decision {
                Decision::Approve => NotificationKind::Approval,
                Decision::Reject => NotificationKind::Rejection,
            };
            self.notify(Notification {
                email: updated.borrower_email.clone(),
                item_title: updated.item_title.clone(),
                borrower_name: updated.borrower_name.clone(),
                lender_name: updated.lender_name.clone(),
                preferred_date: date_text(updated.preferred_date),
                return_date: updated.return_date.map(|d| d.to_string()),
                meeting_place: updated.meeting_place.clone(),
                meeting_time: updated.meeting_time.clone(),
                message: None,
                decision_message: message
                    .map(str::to_string)
                    .or_else(|| updated.decision_message.clone()),
                notification_type: kind,
            })
            .await;
        }

        Ok(updated)
    }

    /// 指定のステータスまで1段階ずつ進める
    ///
    /// 到達済みなら何もしない（逆行しない）。戻り値は更新後のリクエスト。
    pub async fn advance_to(
        &mut self,
        request_id: &str,
        target: RequestStatus,
    ) -> Result<BorrowRequest> {
        let mut current = self
            .get(request_id)
            .cloned()
            .ok_or(LendingError::RequestNotFound)?;
        let path = domain::advancement_path(current.status, target)?;
        if path.is_empty() {
            tracing::debug!(request_id = %request_id, status = current.status.as_str(), "Borrow request already advanced");
        }

        for step in path {
            current = self
                .persist(
                    &current,
                    mapper::status_changes(step),
                    "Failed to update the request status. Please try again.",
                )
                .await?;
            tracing::info!(request_id = %current.id, status = step.as_str(), "Borrow request advanced");
        }
        Ok(current)
    }

    /// 完了にする（スケジュール経由の同期が使えないときの代替）
    pub async fn complete(&mut self, request_id: &str) -> Result<BorrowRequest> {
        self.advance_to(request_id, RequestStatus::Completed).await
    }

    /// 主キーで更新し、返された行でローカルを置き換える
    async fn persist(
        &mut self,
        current: &BorrowRequest,
        changes: crate::ports::Record,
        failure: &str,
    ) -> Result<BorrowRequest> {
        let (column, value) = current.primary_key();
        let rows = self
            .deps
            .table_store
            .update(
                Table::BorrowRequests,
                Filter::eq(column.as_str(), value),
                changes,
                Some(1),
            )
            .await
            .map_err(|e| {
                tracing::error!(request_id = %current.id, error = %e, "Failed to update borrow request");
                LendingError::remote(failure, e)
            })?;

        let Some(row) = rows.first() else {
            tracing::warn!(request_id = %current.id, "Borrow request update returned no rows");
            return Err(LendingError::Unresolved);
        };

        let mut updated = mapper::map_borrow_request(row, Utc::now());
        if updated.lender_email.is_none() {
            updated.lender_email = current.lender_email.clone();
        }
        let known = vec![current.id.clone(), updated.id.clone()];
        self.merge_confirmed(updated.clone(), &known);
        Ok(updated)
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.deps.notification_service.send(&notification).await {
            tracing::warn!(
                kind = ?notification.notification_type,
                error = %e,
                "Failed to send notification"
            );
        }
    }

    /// 借り手としてのリクエスト（上書き適用済み）
    pub fn borrower_requests(
        &self,
        overrides: &HashMap<String, RequestStatus>,
    ) -> Vec<BorrowRequest> {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        domain::borrower_requests_for_user(&self.requests, user_id, overrides)
    }

    /// 貸し手としてのリクエスト（上書き適用済み）
    pub fn lender_requests(
        &self,
        overrides: &HashMap<String, RequestStatus>,
    ) -> Vec<BorrowRequest> {
        let user_id = self.user_id.as_deref().unwrap_or_default();
        domain::lender_requests_for_user(&self.requests, user_id, overrides)
    }

    pub fn active_requests_by_item(&self) -> HashMap<String, BorrowRequest> {
        domain::active_requests_by_item(&self.requests)
    }

    pub fn pending_count(&self) -> usize {
        domain::count_pending(&self.requests)
    }
}

fn date_text(date: Option<chrono::NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryTableStore;
    use crate::adapters::mock::NotificationService;
    use crate::ports::Record;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn store() -> BorrowRequestStore {
        BorrowRequestStore::new(ServiceDependencies {
            table_store: Arc::new(InMemoryTableStore::new()),
            notification_service: Arc::new(NotificationService::new()),
        })
    }

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn event(kind: ChangeKind, old: Option<Value>, new: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            table: Table::BorrowRequests,
            kind,
            old: old.map(row),
            new: new.map(row),
        }
    }

    fn request_row(id: Value, status: &str) -> Value {
        json!({
            "id": id,
            "item_id": "i1",
            "borrower_id": "b1",
            "owner_id": "l1",
            "status": status,
            "request_date": "2025-10-01T09:00:00Z",
        })
    }

    #[test]
    fn test_repeated_insert_and_update_keep_one_row() {
        let mut store = store();
        let inserted = event(ChangeKind::Insert, None, Some(request_row(json!(1), "pending")));

        store.apply_realtime_change(&inserted);
        store.apply_realtime_change(&inserted);
        assert_eq!(store.requests().len(), 1);

        let updated = event(ChangeKind::Update, None, Some(request_row(json!(1), "approved")));
        store.apply_realtime_change(&updated);
        store.apply_realtime_change(&updated);

        assert_eq!(store.requests().len(), 1);
        assert_eq!(store.get("1").map(|r| r.status), Some(RequestStatus::Approved));
    }

    #[test]
    fn test_delete_removes_by_id_or_uuid() {
        let mut store = store();
        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(request_row(json!(1), "pending")),
        ));
        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(json!({"uuid": "u-2", "item_id": "i2", "borrower_id": "b1", "status": "pending"})),
        ));
        assert_eq!(store.requests().len(), 2);

        let by_id = event(ChangeKind::Delete, Some(json!({"id": 1})), None);
        store.apply_realtime_change(&by_id);
        store.apply_realtime_change(&by_id);
        assert!(store.get("1").is_none());
        assert_eq!(store.requests().len(), 1);

        store.apply_realtime_change(&event(ChangeKind::Delete, Some(json!({"uuid": "u-2"})), None));
        assert!(store.requests().is_empty());
    }

    #[test]
    fn test_closed_store_ignores_changes() {
        let mut store = store();
        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(request_row(json!(1), "pending")),
        ));
        store.close();

        store.apply_realtime_change(&event(
            ChangeKind::Update,
            None,
            Some(request_row(json!(1), "approved")),
        ));
        store.apply_realtime_change(&event(ChangeKind::Delete, Some(json!({"id": 1})), None));

        assert!(!store.is_live());
        assert_eq!(store.get("1").map(|r| r.status), Some(RequestStatus::Pending));
    }

    #[test]
    fn test_changes_for_other_tables_are_ignored() {
        let mut store = store();
        let mut other = event(ChangeKind::Insert, None, Some(request_row(json!(1), "pending")));
        other.table = Table::BorrowSchedules;

        store.apply_realtime_change(&other);

        assert!(store.requests().is_empty());
    }
}
