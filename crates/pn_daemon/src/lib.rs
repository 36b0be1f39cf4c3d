//! pn_daemon — the per-identity protocol daemon shell
//!
//! One long-running process per identity. It owns the encrypted store, keeps
//! a streaming subscription to the relay alive with bounded backoff, decrypts
//! and decodes every inbound envelope, and serializes outbound traffic per
//! peer (the session record is a read-modify-write critical section).
//!
//! Application behavior — what to do with a decoded message — belongs to the
//! caller: inbound messages arrive on a channel, outbound ones go through
//! [`Daemon::send`] / [`Daemon::send_chat_prompt`].

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;

pub use client::RelayClient;
pub use config::DaemonConfig;
pub use daemon::{Daemon, Inbound};
pub use error::DaemonError;
