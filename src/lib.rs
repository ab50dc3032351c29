//! Sessiongate - A session-aware reverse proxy for per-user backends
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP and WebSocket traffic by path prefix and session cookie
//! - Accepts new routes at runtime through a key-protected `/api` endpoint
//! - Persists the route table so routes survive restarts
//! - Reaps routes that go idle and kills their backing Docker containers
//! - Drops routes whose backend stops answering
//! - Uses connection pooling for efficient backend communication

pub mod admin;
pub mod close_watch;
pub mod config;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod plumb;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod route;
pub mod store;
