pub mod table_store;

pub use table_store::{Operation, TableStore as InMemoryTableStore};
