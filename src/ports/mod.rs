pub mod notification_service;
pub mod table_store;

pub use notification_service::{Notification, NotificationKind, NotificationService};
pub use table_store::{
    ChangeEvent, ChangeKind, Filter, Order, Query, Record, StoreError, Table, TableStore,
};
