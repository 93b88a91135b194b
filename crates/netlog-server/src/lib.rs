//! # netlog-server
//!
//! Process-local registry of named UDP endpoints.
//!
//! ## Architecture
//!
//! - [`store::AtomicChain`] holds every endpoint in an insert-only lock-free
//!   chain, so lookups from the dispatch thread never wait on a writer.
//! - [`mux::Multiplexer`] wraps `mio::Poll`; each endpoint socket is registered
//!   under its [`EndpointId`] and a keep-alive timer runs alongside.
//! - The dispatch thread resolves each readiness event to its endpoint, drains
//!   the socket and invokes the attached callback synchronously.
//! - [`Registry`] is the facade; [`global`] exposes one registry per process.
//!
//! All callbacks run on the single dispatch thread, one at a time.

pub mod bind;
mod dispatch;
pub mod endpoint;
pub mod error;
pub mod global;
pub mod mux;
mod registry;
pub mod store;

pub use dispatch::RegistryStats;
pub use endpoint::{Datagram, EndpointHandle, EndpointId};
pub use error::{RegistryError, Result};
pub use registry::Registry;
