//! WebSocket layer: connection handling, message routing, subscriptions.
//!
//! The endpoint at `/ws` streams [`crate::domain::StatusEvent`]s to
//! clients that subscribe per pool, and answers pool state queries.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;
