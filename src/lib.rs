//! BiNinja client library
//!
//! One TCP connection to a BiNinja server, multiplexed into channels, one
//! channel per download. Each download is a packet-driven state machine with
//! its own writer thread.

pub mod channel;
pub mod cli;
pub mod config;
pub mod connection;
pub mod console;
pub mod controller;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod metadata;
pub mod mux;
pub mod orchestrator;
pub mod packet;
pub mod protocol;
pub mod protocol_core;
pub mod queue;
pub mod registry;
pub mod request;
pub mod session;
pub mod target;
pub mod transfer_log;
pub mod ui;

pub use error::{Error, Result};
