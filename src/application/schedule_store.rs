use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{
    self, AuthUser, BorrowRequest, BorrowSchedule, RequestStatus, ScheduleDraft,
};
use crate::ports::{ChangeEvent, ChangeKind, Filter, Query, Table};

use super::errors::{LendingError, Result};
use super::mapper;
use super::ServiceDependencies;

/// 貸出スケジュールのストア
///
/// 永続化されたスケジュールのみを保持する。仮スケジュールは `cards` で都度合成する。
pub struct BorrowScheduleStore {
    deps: ServiceDependencies,
    schedules: Vec<BorrowSchedule>,
    live: bool,
}

pub fn participant_filter(user_id: &str) -> Filter {
    Filter::or([
        Filter::eq("borrower_id", user_id),
        Filter::eq("lender_id", user_id),
    ])
}

impl BorrowScheduleStore {
    pub fn new(deps: ServiceDependencies) -> Self {
        Self {
            deps,
            schedules: Vec::new(),
            live: true,
        }
    }

    pub fn schedules(&self) -> &[BorrowSchedule] {
        &self.schedules
    }

    pub fn get(&self, id: &str) -> Option<&BorrowSchedule> {
        self.schedules.iter().find(|schedule| schedule.id == id)
    }

    pub fn close(&mut self) {
        self.live = false;
    }

    pub async fn fetch_for_user(&mut self, user_id: &str) -> Result<()> {
        if user_id.is_empty() {
            self.schedules.clear();
            return Ok(());
        }

        let query = Query::new()
            .filter(participant_filter(user_id))
            .order_by("start_date", false);
        let rows = self
            .deps
            .table_store
            .select(Table::BorrowSchedules, query)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Failed to load borrow schedules");
                LendingError::remote("Failed to load borrow schedules", e)
            })?;

        let now = Utc::now();
        self.schedules = rows
            .iter()
            .map(|row| mapper::map_borrow_schedule(row, now))
            .collect();
        Ok(())
    }

    pub fn apply_realtime_change(&mut self, event: &ChangeEvent) {
        if !self.live || event.table != Table::BorrowSchedules {
            return;
        }
        match event.kind {
            ChangeKind::Delete => {
                if let Some(old) = &event.old {
                    let removed = mapper::map_borrow_schedule(old, Utc::now());
                    self.schedules.retain(|schedule| schedule.id != removed.id);
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                if let Some(new) = &event.new {
                    self.upsert(mapper::map_borrow_schedule(new, Utc::now()));
                }
            }
        }
    }

    pub fn upsert(&mut self, schedule: BorrowSchedule) {
        match self.schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => self.schedules.push(schedule),
        }
    }

    /// 表示用の一覧（仮スケジュールを含む）
    pub fn cards(&self, requests: &[BorrowRequest]) -> Vec<BorrowSchedule> {
        domain::schedule_cards(&self.schedules, requests)
    }

    /// リクエストの実効ステータス
    pub fn overrides(&self) -> HashMap<String, RequestStatus> {
        domain::request_stage_overrides(&self.schedules)
    }

    /// リクエストに紐づく永続化済みスケジュール
    pub fn for_request(&self, request: &BorrowRequest) -> Option<&BorrowSchedule> {
        self.schedules.iter().find(|schedule| {
            schedule
                .request_id
                .as_deref()
                .is_some_and(|id| request.is_identified_by(id))
        })
    }

    /// 受け渡しを手配する（リモートで作成されてからローカルに追加）
    pub async fn create(
        &mut self,
        request: &BorrowRequest,
        viewer: &AuthUser,
        draft: &ScheduleDraft,
        now: DateTime<Utc>,
    ) -> Result<BorrowSchedule> {
        if self.for_request(request).is_some() {
            return Err(LendingError::Validation(
                "This request already has a schedule".to_string(),
            ));
        }
        let (schedule, event) = domain::arrange(request, viewer, draft, now)?;

        let inserted = self
            .deps
            .table_store
            .insert(Table::BorrowSchedules, mapper::schedule_record(&schedule))
            .await
            .map_err(|e| {
                tracing::error!(request_id = %request.id, error = %e, "Failed to create borrow schedule");
                LendingError::remote("Failed to create the schedule. Please try again.", e)
            })?;

        let created = mapper::map_borrow_schedule(&inserted, now);
        tracing::info!(
            schedule_id = %created.id,
            request_id = %event.request_id,
            start = %event.start_date,
            end = %event.end_date,
            "Borrow schedule created"
        );
        self.upsert(created.clone());
        Ok(created)
    }

    /// 返却用QRを発行する（リモートで保存されてからローカルに反映）
    pub async fn generate_return_qr(
        &mut self,
        schedule_id: &str,
        viewer: &AuthUser,
        now: DateTime<Utc>,
    ) -> Result<BorrowSchedule> {
        let current = self
            .get(schedule_id)
            .cloned()
            .ok_or(LendingError::ScheduleNotFound)?;
        let (updated, _event) = domain::generate_return_qr(&current, viewer, now)?;

        let rows = self
            .deps
            .table_store
            .update(
                Table::BorrowSchedules,
                Filter::eq("id", mapper::id_value(&current.id)),
                mapper::return_qr_changes(&updated),
                Some(1),
            )
            .await
            .map_err(|e| {
                tracing::error!(schedule_id = %current.id, error = %e, "Failed to save return QR");
                LendingError::remote("Failed to generate the return QR. Please try again.", e)
            })?;
        let Some(row) = rows.first() else {
            tracing::warn!(schedule_id = %current.id, "Return QR update returned no rows");
            return Err(LendingError::Unresolved);
        };

        let confirmed = mapper::map_borrow_schedule(row, now);
        self.upsert(confirmed.clone());
        Ok(confirmed)
    }

    /// スキャンなどで確定した状態をローカルに反映する
    pub fn commit_local(&mut self, schedule: BorrowSchedule) {
        self.upsert(schedule);
    }

    /// `status` と `return_ready` を保存する
    pub async fn persist_state(&self, schedule: &BorrowSchedule) -> Result<()> {
        let rows = self
            .deps
            .table_store
            .update(
                Table::BorrowSchedules,
                Filter::eq("id", mapper::id_value(&schedule.id)),
                mapper::schedule_state_changes(schedule),
                Some(1),
            )
            .await
            .map_err(|e| {
                tracing::error!(schedule_id = %schedule.id, error = %e, "Failed to save schedule status");
                LendingError::remote("Failed to save the schedule status", e)
            })?;
        if rows.is_empty() {
            tracing::warn!(schedule_id = %schedule.id, "Schedule status update returned no rows");
            return Err(LendingError::Unresolved);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryTableStore;
    use crate::adapters::mock::NotificationService;
    use crate::domain::ScheduleStatus;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn store() -> BorrowScheduleStore {
        BorrowScheduleStore::new(ServiceDependencies {
            table_store: Arc::new(InMemoryTableStore::new()),
            notification_service: Arc::new(NotificationService::new()),
        })
    }

    fn event(kind: ChangeKind, old: Option<Value>, new: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            table: Table::BorrowSchedules,
            kind,
            old: old.and_then(|v| v.as_object().cloned()),
            new: new.and_then(|v| v.as_object().cloned()),
        }
    }

    fn schedule_row(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "request_id": "7",
            "item_id": "i1",
            "borrower_id": "b1",
            "borrower_name": "Borrower One",
            "lender_id": "l1",
            "lender_name": "Lender One",
            "status": status,
        })
    }

    #[test]
    fn test_repeated_changes_keep_one_schedule() {
        let mut store = store();
        let inserted = event(ChangeKind::Insert, None, Some(schedule_row("s1", "awaiting_handoff")));
        let updated = event(ChangeKind::Update, None, Some(schedule_row("s1", "borrowed")));

        store.apply_realtime_change(&inserted);
        store.apply_realtime_change(&inserted);
        store.apply_realtime_change(&updated);
        store.apply_realtime_change(&updated);

        assert_eq!(store.schedules().len(), 1);
        assert_eq!(store.get("s1").map(|s| s.status), Some(ScheduleStatus::Borrowed));
    }

    #[test]
    fn test_delete_removes_schedule() {
        let mut store = store();
        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(schedule_row("s1", "awaiting_handoff")),
        ));
        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(schedule_row("s2", "awaiting_handoff")),
        ));

        let deleted = event(ChangeKind::Delete, Some(json!({"id": "s1"})), None);
        store.apply_realtime_change(&deleted);
        store.apply_realtime_change(&deleted);

        assert!(store.get("s1").is_none());
        assert_eq!(store.schedules().len(), 1);
        assert!(store.get("s2").is_some());
    }

    #[test]
    fn test_closed_store_ignores_changes() {
        let mut store = store();
        store.close();

        store.apply_realtime_change(&event(
            ChangeKind::Insert,
            None,
            Some(schedule_row("s1", "awaiting_handoff")),
        ));

        assert!(store.schedules().is_empty());
    }
}
