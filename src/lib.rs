pub mod config;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod plugin;
pub mod queue;
pub mod reconcile;
pub mod store;
