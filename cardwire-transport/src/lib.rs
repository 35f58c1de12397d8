//! Cardwire Transport
//!
//! Async transport layer for the Cardwire secure-messaging core: one UDP
//! socket, a CID-keyed session table, and a single-owner event loop that
//! routes datagrams, runs the timers, applies TOFU pinning, and surfaces
//! UI events to the embedding host.
//!
//! # Concurrency Model
//!
//! - All protocol state lives inside one event-loop task; no session's
//!   state machine is ever entered by two tasks concurrently.
//! - The host talks to the loop over a command channel and listens on an
//!   event channel; both are unbounded mpsc.
//! - Card calls never run on the I/O path; the certificate is cached by
//!   the card layer and only re-checked when a dial starts a handshake.
//! - The persistence gateway is `Send + Sync` and may also be read by the
//!   host while the loop writes it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod node;
pub mod pipeline;
pub mod store;
pub mod table;

pub use config::Config;
pub use error::TransportError;
pub use events::{CloseReason, UiEvent};
pub use node::{spawn, NodeHandle, Stores};
pub use store::MemoryStore;
