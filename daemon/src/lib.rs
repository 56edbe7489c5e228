//! swift-runner daemon library
//!
//! Runs untrusted Swift snippets in disposable containers:
//! - Request validation and workspace preparation
//! - Detached container launch with sentinel-file completion polling
//! - Live output streaming to observers keyed by nonce
//! - HTTP/WebSocket and MCP front ends

pub mod backend;
pub mod config;
pub mod http;
pub mod mcp;
pub mod observer;
pub mod poller;
pub mod postprocess;
pub mod registry;
pub mod request;
pub mod runner;
pub mod sentinel;
pub mod workspace;
