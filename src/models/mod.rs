//! Domain models for CrewLedger.
//!
//! # Core Concepts
//!
//! ## Persisted Records
//!
//! - [`Feature`]: A user-facing unit of work. Its progress and status are
//!   derived from its tasks.
//! - [`Task`]: The smallest assignable unit of work, owned by one feature and
//!   one agent, driven through the lifecycle state machine.
//!
//! ## Derived Views
//!
//! These are computed on demand and never written back:
//!
//! - [`HealthReport`]: Stalled, failed and long-running task buckets.
//! - [`TaskStatistics`]: Completion rate, retries and per-agent counts.
//! - [`FeatureProgress`]: A feature joined with its tasks.
//!
//! ## Transport
//!
//! - [`AgentKind`]: The closed set of agents work can be routed to.
//! - [`Message`]: Flat mailbox record carrying assignments and status reports.

mod agent;
mod feature;
mod health;
mod message;
mod task;

pub use agent::*;
pub use feature::*;
pub use health::*;
pub use message::*;
pub use task::*;
