//! Modelrelay - resilient failover middleware for LLM chat-completion APIs
//!
//! This library intercepts chat-completion requests addressed to one provider
//! and transparently retries, reroutes, or abandons them across a configured
//! pool of provider/model endpoints, gated by rolling health statistics.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod planner;
pub mod store;
pub mod telemetry;
