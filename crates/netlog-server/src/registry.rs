//! Registry facade: initialize, create-or-get endpoints, attach callbacks, stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use netlog_config::{log_registry_debug, log_registry_info, log_registry_warn};
use netlog_config::{BindConfig, Config, RegistryConfig};
use parking_lot::Mutex;

use crate::dispatch::{self, Counters, DispatchContext, RegistryStats};
use crate::endpoint::{Datagram, Endpoint, EndpointHandle, EndpointId};
use crate::error::{RegistryError, Result};
use crate::mux::{Multiplexer, Registrar};
use crate::store::Claim;

/// A set of named UDP endpoints served by one dispatch thread.
///
/// Endpoints are never removed. Dropping the registry cancels and joins its
/// dispatch thread; handles that are still alive keep their sockets open.
pub struct Registry {
    config: RegistryConfig,
    bind: BindConfig,
    ctx: Arc<DispatchContext>,
    registrar: OnceLock<Registrar>,
    initialized: AtomicBool,
    next_id: AtomicUsize,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self::with_config(config.registry.clone(), config.bind.clone())
    }

    pub fn with_config(config: RegistryConfig, bind: BindConfig) -> Self {
        let ctx = DispatchContext {
            endpoints: Default::default(),
            counters: Counters::default(),
            recv_buffer_size: config.recv_buffer_size,
        };
        Self {
            config,
            bind,
            ctx: Arc::new(ctx),
            registrar: OnceLock::new(),
            initialized: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            dispatcher: Mutex::new(None),
        }
    }

    /// Build the multiplexer, install the keep-alive timer and start the
    /// dispatch thread. Fails with `AlreadyInitialized` on a second call.
    pub fn initialize(&self) -> Result<()> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RegistryError::AlreadyInitialized);
        }

        let result = self.start();
        if result.is_err() {
            self.initialized.store(false, Ordering::Release);
        }
        result
    }

    fn start(&self) -> Result<()> {
        let (mut mux, registrar) = Multiplexer::new(self.config.event_capacity)
            .map_err(RegistryError::MultiplexerCreationFailed)?;

        if let Some(interval) = self.config.heartbeat_interval() {
            mux.register_timer(interval);
        }

        let ctx = Arc::clone(&self.ctx);
        let handle = thread::Builder::new()
            .name(self.config.dispatch_thread_name.clone())
            .spawn(move || dispatch::run(mux, &ctx))
            .map_err(RegistryError::DispatchSpawnFailed)?;

        // Only reachable once per registry because of the `initialized` guard.
        let _ = self.registrar.set(registrar);
        *self.dispatcher.lock() = Some(handle);

        log_registry_info!(
            "Registry initialized",
            heartbeat_ms = self.config.heartbeat_interval_ms,
            anonymous_service = self.config.anonymous_service.as_str(),
        );
        Ok(())
    }

    /// Return the endpoint for `name`, creating it if needed.
    ///
    /// `None` (or the configured anonymous service name) always creates a new
    /// endpoint while `allow_duplicates` is set. Any other name is created at
    /// most once: concurrent callers share a single bind. A failed creation
    /// leaves its record to be reused by the next attempt.
    pub fn create_or_get(&self, name: Option<&str>) -> Result<EndpointHandle> {
        let registrar = self.registrar.get().ok_or(RegistryError::NotInitialized)?;
        let service = name.unwrap_or(self.config.anonymous_service.as_str());
        let anonymous = service == self.config.anonymous_service;

        if anonymous && self.config.allow_duplicates {
            let reclaimed = self
                .ctx
                .endpoints
                .find(|ep| ep.service() == service && ep.try_reclaim());
            let endpoint = match reclaimed {
                Some(endpoint) => endpoint,
                None => self
                    .ctx
                    .endpoints
                    .push(Arc::new(Endpoint::reserve(self.next_id(), service, true))),
            };
            return self.open(endpoint, registrar);
        }

        let candidate = Arc::new(Endpoint::reserve(self.next_id(), service, anonymous));
        let endpoint = match self
            .ctx
            .endpoints
            .push_if_absent(candidate, |ep| ep.service() == service)
        {
            Claim::Inserted(endpoint) => return self.open(endpoint, registrar),
            Claim::Existing(endpoint) => endpoint,
        };

        loop {
            if endpoint.wait_settled() {
                return Ok(EndpointHandle::new(Arc::clone(endpoint)));
            }
            // The previous owner failed; whoever reclaims the record binds next.
            if endpoint.try_reclaim() {
                log_registry_debug!("Retrying failed endpoint", service = service);
                return self.open(endpoint, registrar);
            }
        }
    }

    fn open(&self, endpoint: &Arc<Endpoint>, registrar: &Registrar) -> Result<EndpointHandle> {
        match endpoint.open(&self.bind, registrar) {
            Ok(()) => {
                let handle = EndpointHandle::new(Arc::clone(endpoint));
                log_registry_info!(
                    "Endpoint created",
                    service = endpoint.service(),
                    id = endpoint.id().as_usize(),
                    addr = tracing::field::debug(handle.local_addr().ok()),
                );
                Ok(handle)
            }
            Err(e) => {
                log_registry_warn!(
                    "Endpoint creation failed",
                    service = endpoint.service(),
                    code = e.code(),
                    error = tracing::field::display(&e),
                );
                Err(e)
            }
        }
    }

    fn next_id(&self) -> EndpointId {
        EndpointId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Replace the callback of `endpoint`. See [`EndpointHandle::attach_callback`].
    pub fn attach_callback<C, F>(&self, endpoint: &EndpointHandle, callback: F, context: C)
    where
        C: Send + Sync + 'static,
        F: Fn(&Datagram, &C) + Send + Sync + 'static,
    {
        endpoint.attach_callback(callback, context);
    }

    /// Route every datagram of `endpoint` into a channel. Replaces any
    /// previously attached callback.
    pub fn subscribe(&self, endpoint: &EndpointHandle) -> Receiver<Datagram> {
        let (tx, rx) = crossbeam_channel::unbounded();
        endpoint.attach_callback(
            |datagram, tx: &crossbeam_channel::Sender<Datagram>| {
                // A dropped receiver just discards further datagrams.
                let _ = tx.send(datagram.clone());
            },
            tx,
        );
        rx
    }

    /// Look up a ready endpoint by service name without creating it.
    pub fn get(&self, service: &str) -> Option<EndpointHandle> {
        self.ctx
            .endpoints
            .find(|ep| ep.service() == service && ep.is_ready())
            .map(|ep| EndpointHandle::new(Arc::clone(ep)))
    }

    /// Usable endpoints, newest first.
    pub fn endpoints(&self) -> Vec<EndpointHandle> {
        self.ctx
            .endpoints
            .iter()
            .filter(|ep| ep.is_ready())
            .map(|ep| EndpointHandle::new(Arc::clone(ep)))
            .collect()
    }

    /// Number of usable endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.ctx.endpoints.iter().filter(|ep| ep.is_ready()).count()
    }

    pub fn stats(&self) -> RegistryStats {
        self.ctx.counters.snapshot(self.endpoint_count())
    }

    pub fn is_initialized(&self) -> bool {
        self.registrar.get().is_some()
    }

    /// Signal the dispatch loop to exit and wait for it.
    pub fn stop(&self) -> Result<()> {
        let registrar = self.registrar.get().ok_or(RegistryError::NotInitialized)?;
        if let Err(e) = registrar.cancel_token().cancel() {
            log_registry_warn!("Failed to wake dispatch loop", error = tracing::field::display(&e));
        }
        self.join()
    }

    /// Wait for the dispatch loop without signalling it. Returns immediately
    /// if the loop was already joined.
    pub fn join(&self) -> Result<()> {
        // Take the handle first so the lock is not held while blocking.
        let handle = self.dispatcher.lock().take();
        match handle {
            // Called from a callback: the loop exits once the callback returns.
            Some(handle) if handle.thread().id() == thread::current().id() => Ok(()),
            Some(handle) => handle.join().map_err(|_| RegistryError::DispatchPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            if let Some(registrar) = self.registrar.get() {
                let _ = registrar.cancel_token().cancel();
            }
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
