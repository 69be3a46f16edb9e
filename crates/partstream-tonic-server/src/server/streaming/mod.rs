//! Per-exchange frame handling.
//!
//! - [`handshake`] - Validates the init handshake that opens every exchange.
//! - [`coordinator`] - Feeds data frames through the worker pool in order.
//! - [`processor`] - The work a worker performs on one data frame.
//! - [`request`] - Messages between exchanges and workers.

pub mod coordinator;
pub mod handshake;
pub mod processor;
pub mod request;
