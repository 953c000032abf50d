#![allow(dead_code)]

use campus_lending::adapters::memory::InMemoryTableStore;
use campus_lending::adapters::mock::NotificationService as MockNotificationService;
use campus_lending::application::{BorrowDraft, ItemDraft, LendingSession, ServiceDependencies};
use campus_lending::domain::{
    AuthUser, BorrowRequest, BorrowSchedule, Decision, ScanKind, ScheduleDraft,
};
use campus_lending::ports::{Record, Table};
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::sync::Arc;

/// インメモリのアダプターで組み立てたテスト環境
pub struct TestEnv {
    pub store: Arc<InMemoryTableStore>,
    pub notifier: Arc<MockNotificationService>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryTableStore::new()),
            notifier: Arc::new(MockNotificationService::new()),
        }
    }

    pub fn deps(&self) -> ServiceDependencies {
        ServiceDependencies {
            table_store: self.store.clone(),
            notification_service: self.notifier.clone(),
        }
    }

    /// 読み込み済みのセッション
    pub async fn session(&self, user: AuthUser) -> LendingSession {
        let mut session = LendingSession::new(self.deps(), user);
        session.load().await.expect("Failed to load session");
        session
    }

    /// 貸し手L1の出品物を登録し、そのIDを返す
    pub fn seed_item(&self, quantity: i64) -> String {
        let row = self.store.seed(
            Table::Items,
            record(json!({
                "title": "Graphing Calculator",
                "category": "Electronics",
                "owner_id": "l1",
                "lender_name": "Lender One",
                "lender_email": "lender@campus.edu",
                "quantity": quantity,
                "campus": "Main Campus",
            })),
        );
        text(&row["id"])
    }

    pub fn seed_profile(&self, id: &str) {
        self.store.seed(
            Table::Profiles,
            record(json!({"id": id, "rating": null})),
        );
    }

    pub fn item_quantity(&self, item_id: &str) -> i64 {
        self.store
            .rows(Table::Items)
            .iter()
            .find(|row| text(&row["id"]) == item_id)
            .and_then(|row| row["quantity"].as_i64())
            .expect("item not found")
    }
}

pub fn borrower() -> AuthUser {
    AuthUser::new("b1", "Borrower One").with_email("borrower@campus.edu")
}

pub fn lender() -> AuthUser {
    AuthUser::new("l1", "Lender One").with_email("lender@campus.edu")
}

pub fn outsider() -> AuthUser {
    AuthUser::new("x1", "Someone Else")
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("object literal")
}

pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn borrow_draft(item_id: &str) -> BorrowDraft {
    BorrowDraft {
        item_id: item_id.to_string(),
        preferred_date: Some(date(2025, 10, 20)),
        return_date: Some(date(2025, 10, 27)),
        meeting_place: Some("Library Atrium".to_string()),
        meeting_time: Some("14:00".to_string()),
        message: "Need it for my statistics final".to_string(),
    }
}

pub fn item_draft(title: &str) -> ItemDraft {
    ItemDraft {
        title: title.to_string(),
        category: Some("Books".to_string()),
        condition: Some("Good".to_string()),
        description: "  Fourth edition  ".to_string(),
        campus: Some("North Campus".to_string()),
        quantity: Some(json!(2)),
        deposit: true,
        image_url: None,
    }
}

pub fn schedule_draft() -> ScheduleDraft {
    ScheduleDraft {
        start_date: Some(date(2025, 10, 20)),
        end_date: Some(date(2025, 10, 27)),
        meeting_place: "Library Atrium".to_string(),
        meeting_time: "14:00".to_string(),
    }
}

// ============================================================================
// 取引の各段階まで進めるヘルパー
// ============================================================================

/// 借り手B1が数量2の物品I1を申請する
pub async fn submitted(env: &TestEnv) -> BorrowRequest {
    let item_id = env.seed_item(2);
    let mut session = env.session(borrower()).await;
    session
        .submit_request(&borrow_draft(&item_id))
        .await
        .expect("submit failed")
}

/// 貸し手L1が承認する
pub async fn approved(env: &TestEnv) -> BorrowRequest {
    let request = submitted(env).await;
    let mut session = env.session(lender()).await;
    session
        .decide(&request.id, Decision::Approve, None)
        .await
        .expect("approve failed")
}

/// 貸し手L1が受け渡しを手配する
pub async fn arranged(env: &TestEnv) -> (BorrowRequest, BorrowSchedule) {
    let request = approved(env).await;
    let mut session = env.session(lender()).await;
    let schedule = session
        .arrange_schedule(&request.id, &schedule_draft())
        .await
        .expect("arrange failed");
    (request, schedule)
}

/// 貸し手L1が借り手のQRを読み取り、貸出中になる
pub async fn handed_off(env: &TestEnv) -> (BorrowRequest, BorrowSchedule) {
    let (request, schedule) = arranged(env).await;
    let code = env
        .session(borrower())
        .await
        .handoff_qr(&schedule.id)
        .expect("handoff QR failed");
    let report = env
        .session(lender())
        .await
        .scan(&schedule.id, ScanKind::Handoff, code.value())
        .await
        .expect("handoff scan failed");
    (request, report.schedule)
}

/// 返却用QRを発行して借り手が読み取り、完了になる
pub async fn returned(env: &TestEnv) -> (BorrowRequest, BorrowSchedule) {
    let (request, schedule) = handed_off(env).await;
    let code = env
        .session(lender())
        .await
        .generate_return_qr(&schedule.id)
        .await
        .expect("return QR failed");
    let report = env
        .session(borrower())
        .await
        .scan(&schedule.id, ScanKind::Return, code.value())
        .await
        .expect("return scan failed");
    (request, report.schedule)
}

/// 保存されているリクエストの行のステータス
pub fn stored_request_status(env: &TestEnv, request_id: &str) -> String {
    env.store
        .rows(Table::BorrowRequests)
        .iter()
        .find(|row| text(&row["id"]) == request_id)
        .map(|row| text(&row["status"]))
        .expect("request not found")
}
