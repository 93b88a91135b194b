//! Process-wide registry with the one-per-process call surface.
//!
//! ```ignore
//! netlog_server::global::initialize(&netlog_config::Config::default())?;
//! let endpoint = netlog_server::global::create_or_get(Some("1979"))?;
//! netlog_server::global::attach_callback(&endpoint, |d, _: &()| println!("{}", d.text()), ());
//! ```

use std::sync::OnceLock;

use netlog_config::Config;

use crate::endpoint::{Datagram, EndpointHandle};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Initialize the process-wide registry. The configuration of the first call
/// wins; a second successful call fails with `AlreadyInitialized`.
pub fn initialize(config: &Config) -> Result<()> {
    GLOBAL.get_or_init(|| Registry::new(config)).initialize()
}

/// The process-wide registry, once `initialize` has succeeded.
pub fn registry() -> Result<&'static Registry> {
    GLOBAL
        .get()
        .filter(|registry| registry.is_initialized())
        .ok_or(RegistryError::NotInitialized)
}

pub fn create_or_get(name: Option<&str>) -> Result<EndpointHandle> {
    registry()?.create_or_get(name)
}

pub fn attach_callback<C, F>(endpoint: &EndpointHandle, callback: F, context: C)
where
    C: Send + Sync + 'static,
    F: Fn(&Datagram, &C) + Send + Sync + 'static,
{
    endpoint.attach_callback(callback, context);
}

/// Cancel the process-wide dispatch loop and wait for it.
pub fn stop() -> Result<()> {
    registry()?.stop()
}
