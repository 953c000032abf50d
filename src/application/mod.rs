mod errors;
pub mod inventory;
pub mod mapper;
pub mod rating;
pub mod request_store;
pub mod schedule_store;
pub mod session;

use std::sync::Arc;

use crate::ports::{NotificationService, TableStore};

pub use errors::{DUPLICATE_ACTIVE_REQUEST, ErrorKind, LendingError, REFRESH_AND_RETRY, Result};
pub use inventory::ItemInventory;
pub use mapper::{BorrowDraft, ItemDraft};
pub use rating::RatingCoordinator;
pub use request_store::BorrowRequestStore;
pub use schedule_store::BorrowScheduleStore;
pub use session::{Banner, BannerTone, DashboardView, LendingSession, ScanReport};

/// サービスの依存関係
///
/// 永続化クライアントと通知サービスは外から注入する。
/// 各ストアはこれを複製して持つ。
#[derive(Clone)]
pub struct ServiceDependencies {
    pub table_store: Arc<dyn TableStore>,
    pub notification_service: Arc<dyn NotificationService>,
}
