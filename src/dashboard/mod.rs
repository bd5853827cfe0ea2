//! Dashboard WebSocket hub (spec.md §4.H): authenticated subscribers,
//! initial-state snapshots, and live fan-out of agent/metrics/summary
//! events.

pub mod hub;
pub mod subscriber;
pub mod ws;

pub use hub::{AgentSummary, Hub, Summary};
pub use subscriber::{Frame, Subscriber};
pub use ws::{upgrade_handler, DashboardState};
