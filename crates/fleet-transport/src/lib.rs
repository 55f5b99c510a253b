// ============================================
// File: crates/fleet-transport/src/lib.rs
// ============================================
//! # Fleet Transport - Remote Panel Protocol
//!
//! ## Creation Reason
//! Provides the transport abstraction the control plane uses to reach
//! remote panels, the production HTTP client and an in-memory mock fleet.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`traits`]: `PanelTransport` trait, requests, responses, tokens
//! - [`http`]: reqwest implementation of the panel API
//! - [`mock`]: In-memory panel fleet for tests
//! - [`error`]: Transport-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                fleet-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │     fleet-core         fleet-transport              │
//! │                        You are here ◄──             │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │              fleet-common                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//! ```text
//! Session Manager ──► PanelTransport::login ──► POST /login ──► cookie
//!                 ──► PanelTransport::call  ──► /panel/api/... ──► {success, msg, obj}
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Transports are stateless with respect to sessions
//! - The mock is compiled into the library so integration tests of
//!   downstream crates can use it
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod http;
pub mod mock;
pub mod traits;

pub use error::{Result, TransportError};
pub use http::{HttpPanelTransport, HttpTransportConfig};
pub use mock::{MockPanel, MockPanelFleet};
pub use traits::{Method, PanelCredentials, PanelTransport, RemoteRequest, RemoteResponse, SessionToken};
