//! HTTP API: configuration, request context, upload orchestration and routing.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
