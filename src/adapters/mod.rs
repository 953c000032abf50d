pub mod http;
pub mod memory;
pub mod mock;
pub mod postgres;
