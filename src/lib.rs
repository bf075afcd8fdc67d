//! # Analysis Engine Library
//!
//! Background job engine for creator analytics: a priority queue drained by a
//! rate-limited worker pool, per-dependency circuit breakers, a persisted
//! lifecycle with heartbeats, a consistency validator with repair, and a
//! reserve/commit/refund credit gate. The HTTP surface lives in `handlers`
//! and `server`.

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod consistency;
pub mod credit_gate;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod queue;
pub mod rate_limiter;
pub mod repositories;
pub mod server;
pub mod tasks;
pub mod telemetry;
pub mod worker_pool;
pub use migration;
