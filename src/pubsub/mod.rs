//! GCP Pub/Sub REST v1 emulation.
//!
//! This module implements the HTTP/JSON surface of Google Cloud Pub/Sub:
//! - Wire types shared with the client adapter
//! - Publisher service for validation, publishing and push fan-out
//! - REST router for topics, subscriptions, pull and acknowledge
//! - Push delivery queue and worker pool

pub mod types;
pub mod publisher;
pub mod rest;
pub mod push_queue;
pub mod push_worker;

pub use types::*;
