//! Waygate — a WhatsApp transport core with interchangeable adapters.
//!
//! One daemon, two ways onto the network: a WebSocket client of a
//! native protocol gateway (primary) and an HTTP client of a browser
//! automation bridge (fallback). The orchestrator picks whichever
//! works, deduplicates inbound traffic across them, and exposes a
//! single stable client surface to business code.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod config;
pub mod jid;
pub mod logging;
pub mod orchestrator;
pub mod pairing;
pub mod session;
pub mod transport;
