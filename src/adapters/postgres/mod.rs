pub mod table_store;

// パブリックに型を再エクスポート
pub use table_store::TableStore as PostgresTableStore;
