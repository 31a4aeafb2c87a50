//! Captain binary internals: configuration and the local HTTP API

pub mod api;
pub mod config;
