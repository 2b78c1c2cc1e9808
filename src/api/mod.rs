//! Client-facing HTTP API

pub mod kv_http;
