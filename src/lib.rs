//! Pipeline Queue: durable task scheduler for a multi-stage AI pipeline.

pub mod config;
pub mod entity;
pub mod error;
pub mod queue;
pub mod store;
