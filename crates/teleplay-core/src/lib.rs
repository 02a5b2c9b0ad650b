//! Core of the teleplay bot: a checkpointed long-poll message dispatcher.
//!
//! The message source (Telegram today) lives behind the [`source::MessageSource`]
//! port and is implemented in an adapter crate. Everything here is
//! transport-agnostic.

pub mod bot;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod poll;
pub mod retry;
pub mod session;
pub mod source;
pub mod store;

pub use errors::{Error, Result};
