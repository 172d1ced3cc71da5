#![forbid(unsafe_code)]

//! Production adapters and wiring for the paintboard dispatch core.

pub mod config;
pub mod directory;
pub mod feed;
pub mod http;
pub mod remote;
