//! Chatgate Server - Horizontally scalable realtime websocket gateway.
//!
//! This crate provides:
//! - Issuance and verification of short-lived realtime tokens
//! - Rate limiting backed by a counter store shared across processes
//! - A websocket gateway that relays client messages to every client of
//!   every process through a shared pub/sub bus
//! - Heartbeat-based eviction of dead connections
//!
//! # Architecture
//!
//! Processes keep no shared in-memory state. Admission counters live in the
//! counter store and message fan-out goes through the message bus, so any
//! number of identical processes can run behind a load balancer.

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod store;
