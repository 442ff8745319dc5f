pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod monitor;
pub mod progress;
pub mod recovery;
pub mod render;
pub mod store;

pub use error::{LedgerError, Result};
