pub mod api;
pub mod claims;
pub mod documents;
pub mod models;
pub mod report;
pub mod store;
