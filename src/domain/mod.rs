pub mod borrow_request;
pub mod borrow_schedule;
pub mod dashboard;
pub mod errors;
pub mod events;
pub mod item;
pub mod rating;
pub mod value_objects;

pub use borrow_request::*;
pub use borrow_schedule::*;
pub use errors::*;
pub use events::*;
pub use item::*;
pub use rating::*;
pub use value_objects::*;
