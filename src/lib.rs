//! Task lifecycle and reliable event delivery for field cleanup operations.
//!
//! The core is a task state machine over durable storage with an
//! append-only assignment audit trail and a transactional outbox: every
//! accepted command mutates the task, appends one history entry, and queues
//! one event in a single transaction. The [`relay::OutboxRelay`] drains
//! queued events to a [`broker::Broker`] with at-least-once delivery,
//! surviving broker outages and process restarts.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod relay;
pub mod types;
