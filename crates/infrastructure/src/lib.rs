pub mod dynamodb;
pub mod memory;
pub mod models;
pub mod store;

pub use dynamodb::*;
pub use memory::*;
pub use store::*;
