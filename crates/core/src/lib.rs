#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dispatch core for collaborative painting of a shared remote pixel canvas.
//!
//! The crate keeps a live mirror of the remote board, tracks which cells each
//! task still wants changed, and hands those cells out to a pool of
//! rate-limited write credentials.

pub mod board;
pub mod config;
pub mod credential;
pub mod error;
pub mod image;
pub mod model;
pub mod pending_set;
pub mod ports;
pub mod scheduler;
pub mod task;
pub mod throttle;

mod util;

pub use util::{new_ulid, now_ms};
