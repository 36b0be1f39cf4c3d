//! pn_proto — Wire types, envelopes, and serialisation for Postern
//!
//! All on-wire types are JSON and strictly validated. The relay routes
//! envelopes without being able to read their bodies; the application
//! message union only ever exists in plaintext on the two endpoints.
//!
//! # Modules
//! - `envelope` — transport envelope and the two ciphertext body forms
//! - `app`      — kind-discriminated application messages
//! - `api`      — relay request/response bodies shared by client and server
//! - `error`    — unified error type

pub mod api;
pub mod app;
pub mod envelope;
pub mod error;

pub use app::AppMessage;
pub use envelope::{Envelope, EnvelopeType};
pub use error::ProtoError;
