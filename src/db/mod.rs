pub mod models;
pub mod queries;
pub mod store;

pub use store::{RelationshipStore, UserActivitySource};
