// src/api/mod.rs
//!
//! HTTP surface: event ingress plus the alert/incident read API.

pub mod handlers;
pub mod models;
pub mod server;
pub mod tls;
