//! # pubsub-testkit
//!
//! Test support for applications built on Google Cloud Pub/Sub.
//!
//! pubsub-testkit starts a Pub/Sub emulator for a test (in-process, in a
//! Docker container, or an already-running one), gives the test a REST
//! client for it, and bridges push delivery into axum handlers.
//!
//! - [`harness::PubSubTestEnv`]: one emulator plus client per test
//! - [`client`]: the [`client::PubSub`] trait, [`client::PubSubClient`] and a pull [`client::Subscriber`]
//! - [`push`]: push envelope types, `push_route` and a recording [`push::PushEndpoint`]
//! - [`emulator`]: emulator lifecycle with bounded startup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod emulator;
pub mod error;
pub mod harness;
pub mod logging;
pub mod metrics;
pub mod pubsub;
pub mod push;
pub mod server;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
