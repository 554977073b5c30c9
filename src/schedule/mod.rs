pub mod conflict;
pub mod manager;
pub mod model;
pub mod reconcile;
pub mod store;
