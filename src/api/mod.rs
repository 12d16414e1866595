pub mod nlq;
pub mod query;
