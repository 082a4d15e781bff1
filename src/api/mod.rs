//! HTTP API Module
//!
//! Thin REST façade over the distributed core.

mod http;

pub use http::HttpServer;
