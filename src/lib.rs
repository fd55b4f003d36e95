//! Edge agent: turns per-frame person detections into durable, idempotent
//! store events.
//!
//! # Overview
//!
//! Each camera's detections are classified against its regions of interest
//! (payment point, queue, staff area, consumption area, entry lines), folded
//! into fixed time buckets, and checked against alert rules. Closed buckets,
//! alerts and periodic heartbeats become [`envelope::Envelope`]s that are
//! delivered to the collector at least once and deduplicated there by their
//! receipt id.
//!
//! # Delivery
//!
//! Envelopes go through a bounded in-memory channel to a single sender. What
//! cannot be delivered right away lands in a SQLite outbox and is retried
//! with exponential backoff, across restarts.
//!
//! # Modules
//!
//! - [`geometry`], [`roi`], [`checkout`], [`crossing`], [`classifier`]: per-frame classification
//! - [`model`]: data types for detections, snapshots, buckets and alerts
//! - [`aggregation`], [`rules`]: bucketing and alerting
//! - [`envelope`]: event envelopes and receipt ids
//! - [`storage`], [`transport`], [`backoff`], [`sender`]: durable delivery
//! - [`heartbeat`], [`pipeline`], [`agent`]: long-running tasks and their wiring
//! - [`api`], [`state`]: local status surface
//! - [`config`], [`error`], [`shutdown`]: process concerns

pub mod agent;
pub mod aggregation;
pub mod api;
pub mod backoff;
pub mod checkout;
pub mod classifier;
pub mod config;
pub mod crossing;
pub mod envelope;
pub mod error;
pub mod geometry;
pub mod heartbeat;
pub mod model;
pub mod pipeline;
pub mod roi;
pub mod rules;
pub mod sender;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod transport;
