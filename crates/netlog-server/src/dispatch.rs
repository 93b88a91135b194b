//! The dispatch loop: the only thread that reads sockets and runs callbacks.

use std::io;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netlog_config::{log_dispatch_debug, log_dispatch_error, log_dispatch_trace, log_dispatch_warn};

use crate::endpoint::{Datagram, Endpoint, EndpointId};
use crate::mux::{Multiplexer, Readiness};
use crate::store::AtomicChain;

// Consecutive receive errors tolerated on one socket before yielding to
// other readiness events.
const MAX_RECV_ERRORS: usize = 8;

const POLL_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Endpoints in the store, including failed reservations.
    pub endpoints: usize,
    /// Datagrams handed to a callback.
    pub delivered: u64,
    /// Datagrams received on an endpoint without a callback.
    pub unhandled: u64,
    /// Receive calls that failed with something other than `WouldBlock`.
    pub recv_errors: u64,
    /// Readiness events whose tag matched no ready endpoint.
    pub resolution_misses: u64,
    /// Callbacks that panicked.
    pub callback_panics: u64,
    /// Keep-alive timer expirations.
    pub heartbeats: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    unhandled: AtomicU64,
    recv_errors: AtomicU64,
    resolution_misses: AtomicU64,
    callback_panics: AtomicU64,
    heartbeats: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self, endpoints: usize) -> RegistryStats {
        RegistryStats {
            endpoints,
            delivered: self.delivered.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            resolution_misses: self.resolution_misses.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State the dispatch thread shares with the registry facade.
pub(crate) struct DispatchContext {
    pub(crate) endpoints: AtomicChain<Arc<Endpoint>>,
    pub(crate) counters: Counters,
    pub(crate) recv_buffer_size: usize,
}

/// Run until the multiplexer reports cancellation.
pub(crate) fn run(mut mux: Multiplexer, ctx: &DispatchContext) {
    let mut buf = vec![0u8; ctx.recv_buffer_size.max(1)];
    let mut poll_failures = 0;
    log_dispatch_debug!("Dispatch loop started", buffer = buf.len());

    loop {
        let readiness = match mux.wait() {
            Ok(readiness) => {
                poll_failures = 0;
                readiness
            }
            Err(e) => {
                poll_failures += 1;
                let delay = poll_backoff(poll_failures);
                if poll_failures == 1 {
                    log_dispatch_warn!("Poll failed", error = tracing::field::display(&e));
                } else {
                    log_dispatch_debug!(
                        "Poll still failing",
                        failures = poll_failures,
                        delay_ms = delay.as_millis() as u64,
                    );
                }
                thread::sleep(delay);
                continue;
            }
        };

        match readiness {
            Readiness::Readable(id) => drain(&mux, ctx, id, &mut buf),
            Readiness::TimerFired => {
                Counters::bump(&ctx.counters.heartbeats);
                log_dispatch_trace!("Heartbeat");
            }
            Readiness::Cancelled => break,
        }
    }

    log_dispatch_debug!("Dispatch loop stopped");
}

/// Delay before the next poll after `failures` consecutive poll errors.
fn poll_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    POLL_BACKOFF_INITIAL
        .saturating_mul(1 << exponent)
        .min(POLL_BACKOFF_MAX)
}

/// Resolve `id` and read every queued datagram from its socket.
fn drain(mux: &Multiplexer, ctx: &DispatchContext, id: EndpointId, buf: &mut [u8]) {
    let Some(endpoint) = ctx.endpoints.find(|ep| ep.id() == id) else {
        Counters::bump(&ctx.counters.resolution_misses);
        log_dispatch_trace!("No endpoint for readiness tag", id = id.as_usize());
        return;
    };

    let mut errors = 0;
    loop {
        let Some(received) = endpoint.with_socket(|socket| socket.recv_from(buf)) else {
            Counters::bump(&ctx.counters.resolution_misses);
            return;
        };

        match received {
            Ok((len, peer)) => {
                errors = 0;
                deliver(ctx, endpoint, Datagram::new(buf[..len].to_vec(), peer));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                Counters::bump(&ctx.counters.recv_errors);
                log_dispatch_trace!(
                    "Receive failed",
                    service = endpoint.service(),
                    error = tracing::field::display(&e),
                );
                errors += 1;
                if errors >= MAX_RECV_ERRORS {
                    // The registration is edge-triggered: anything still queued
                    // is only reported again once the socket is re-armed.
                    rearm(mux, endpoint);
                    break;
                }
            }
        }
    }
}

fn rearm(mux: &Multiplexer, endpoint: &Endpoint) {
    let Some(fd) = endpoint.with_socket(|socket| socket.as_raw_fd()) else {
        return;
    };
    if let Err(e) = mux.rearm(fd, endpoint.id()) {
        log_dispatch_warn!(
            "Failed to re-arm socket",
            service = endpoint.service(),
            error = tracing::field::display(&e),
        );
    }
}

fn deliver(ctx: &DispatchContext, endpoint: &Endpoint, datagram: Datagram) {
    let Some(handler) = endpoint.handler() else {
        Counters::bump(&ctx.counters.unhandled);
        return;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler(&datagram))) {
        Ok(()) => {
            endpoint.record_delivery();
            Counters::bump(&ctx.counters.delivered);
        }
        Err(_) => {
            Counters::bump(&ctx.counters.callback_panics);
            log_dispatch_error!("Callback panicked", service = endpoint.service());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_backoff_doubles_and_caps() {
        assert_eq!(poll_backoff(1), Duration::from_millis(10));
        assert_eq!(poll_backoff(2), Duration::from_millis(20));
        assert_eq!(poll_backoff(4), Duration::from_millis(80));
        assert_eq!(poll_backoff(8), POLL_BACKOFF_MAX);
        assert_eq!(poll_backoff(u32::MAX), POLL_BACKOFF_MAX);
    }
}
