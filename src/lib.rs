//! `arc-scheduler` — the regional inference scheduler for the arcnet
//! distributed compute mesh.
//!
//! Leaves first: [`codec`] and [`schema`]
//! underpin [`transport`]; [`state`] projects telemetry carried over
//! `transport`; [`scheduler`] consumes inference requests, scores and
//! reserves candidates out of [`state`], and dispatches or retries over
//! `transport`. [`config`] and [`error`] are the ambient stack; `main.rs`
//! (the `arc-scheduler` binary) wires everything together.

pub mod codec;
pub mod config;
pub mod error;
pub mod geo;
pub mod kafka_transport;
pub mod model;
pub mod schema;
pub mod scheduler;
pub mod state;
pub mod transport;
