//! Blocking client for the pyrelay relay.
//!
//! [`DispatchClient`] uploads files for analysis, runs them through the
//! relay's sandboxed executor and polls for results. [`watch_directory`]
//! drives it from a polled directory tree and from interpreter launches.

pub mod client;
pub mod poll;
pub mod watch_loop;

pub use client::{ClientError, DispatchClient};
pub use poll::{PollOutcome, PollPolicy};
pub use watch_loop::{watch_directory, WatchOptions};
