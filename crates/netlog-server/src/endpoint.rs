//! Named, socket-bound, callback-attachable endpoints.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::Token;
use netlog_config::BindConfig;
use parking_lot::RwLock;

use crate::bind::bind_service;
use crate::error::{RegistryError, Result};
use crate::mux::Registrar;

/// Identifier carried by every poll registration. Token 0 is reserved for
/// the cancellation waker, so ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(usize);

impl EndpointId {
    pub(crate) fn new(raw: usize) -> Self {
        debug_assert!(raw != 0, "id 0 is reserved for the waker");
        Self(raw)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A received datagram, truncated to the configured receive buffer size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    payload: Vec<u8>,
    peer: SocketAddr,
}

impl Datagram {
    pub fn new(payload: Vec<u8>, peer: SocketAddr) -> Self {
        Self { payload, peer }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Type-erased callback with its context already bound.
pub(crate) type Handler = Arc<dyn Fn(&Datagram) + Send + Sync>;

const PENDING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

// Waiters on a pending record yield this many times before sleeping.
const SETTLE_SPINS: u32 = 16;
const SETTLE_BACKOFF_INITIAL: Duration = Duration::from_micros(50);
const SETTLE_BACKOFF_MAX: Duration = Duration::from_millis(10);

/// Store record for one service.
///
/// A record is published in the `PENDING` state before its socket is bound so
/// that concurrent creators of the same service agree on a single owner. The
/// owner then moves it to `READY` or `FAILED`. A failed record holds no socket
/// and is reused by the next creator through [`Endpoint::try_reclaim`], so
/// failed creations never accumulate records.
pub(crate) struct Endpoint {
    id: EndpointId,
    service: String,
    anonymous: bool,
    state: AtomicU8,
    socket: RwLock<Option<UdpSocket>>,
    handler: RwLock<Option<Handler>>,
    delivered: AtomicU64,
}

impl Endpoint {
    pub(crate) fn reserve(id: EndpointId, service: &str, anonymous: bool) -> Self {
        Self {
            id,
            service: service.to_string(),
            anonymous,
            state: AtomicU8::new(PENDING),
            socket: RwLock::new(None),
            handler: RwLock::new(None),
            delivered: AtomicU64::new(0),
        }
    }

    /// Bind the socket and register it for read readiness. Only the thread
    /// that holds the `PENDING` record may call this.
    pub(crate) fn open(&self, bind: &BindConfig, registrar: &Registrar) -> Result<()> {
        self.open_with(bind, |fd, id| registrar.register_read(fd, id))
    }

    pub(crate) fn open_with<R>(&self, bind: &BindConfig, register: R) -> Result<()>
    where
        R: FnOnce(RawFd, EndpointId) -> io::Result<()>,
    {
        let result = self.bind_and_register(bind, register);
        let state = if result.is_ok() { READY } else { FAILED };
        self.state.store(state, Ordering::Release);
        result
    }

    fn bind_and_register<R>(&self, bind: &BindConfig, register: R) -> Result<()>
    where
        R: FnOnce(RawFd, EndpointId) -> io::Result<()>,
    {
        let socket = UdpSocket::from_std(bind_service(&self.service, bind)?);
        let fd = socket.as_raw_fd();

        // The socket must be visible to the dispatch thread before the first
        // readiness event can be reported for it.
        *self.socket.write() = Some(socket);

        if let Err(e) = register(fd, self.id) {
            // Close the socket before the record is marked failed so the port
            // is released.
            drop(self.socket.write().take());
            return Err(RegistryError::MultiplexerRegistrationFailed(e));
        }
        Ok(())
    }

    /// Move a `FAILED` record back to `PENDING`. The caller that wins becomes
    /// the owner and must call `open` next.
    pub(crate) fn try_reclaim(&self) -> bool {
        self.state
            .compare_exchange(FAILED, PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Block until the owner has finished `open`. Returns true if the endpoint
    /// is usable.
    pub(crate) fn wait_settled(&self) -> bool {
        let mut spins = 0;
        let mut delay = SETTLE_BACKOFF_INITIAL;
        loop {
            match self.state.load(Ordering::Acquire) {
                PENDING if spins < SETTLE_SPINS => {
                    spins += 1;
                    thread::yield_now();
                }
                PENDING => {
                    thread::sleep(delay);
                    delay = (delay * 2).min(SETTLE_BACKOFF_MAX);
                }
                state => return state == READY,
            }
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    pub(crate) fn id(&self) -> EndpointId {
        self.id
    }

    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    /// Run `f` against the bound socket, if there is one.
    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&UdpSocket) -> R) -> Option<R> {
        self.socket.read().as_ref().map(f)
    }

    /// Last writer wins. A dispatch already in flight keeps the handler it
    /// cloned before the swap.
    pub(crate) fn set_handler(&self, handler: Handler) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Handler> {
        self.handler.read().clone()
    }

    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared reference to a published endpoint. Equality is identity.
#[derive(Clone)]
pub struct EndpointHandle(Arc<Endpoint>);

impl EndpointHandle {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self(endpoint)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Endpoint {
        &self.0
    }

    pub fn id(&self) -> EndpointId {
        self.0.id
    }

    /// Service name the endpoint was created for.
    pub fn service(&self) -> &str {
        &self.0.service
    }

    /// True if the endpoint was created through the anonymous sentinel.
    pub fn is_anonymous(&self) -> bool {
        self.0.anonymous
    }

    /// Address the socket is bound to. For service "0" this carries the port
    /// chosen by the OS.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.with_socket(|socket| socket.local_addr()).unwrap_or_else(|| {
            Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint not bound"))
        })
    }

    /// Number of datagrams handed to a callback so far.
    pub fn delivered(&self) -> u64 {
        self.0.delivered.load(Ordering::Relaxed)
    }

    /// Replace the callback. `context` is passed by reference to every invocation.
    pub fn attach_callback<C, F>(&self, callback: F, context: C)
    where
        C: Send + Sync + 'static,
        F: Fn(&Datagram, &C) + Send + Sync + 'static,
    {
        self.0
            .set_handler(Arc::new(move |datagram: &Datagram| callback(datagram, &context)));
    }

    pub fn has_callback(&self) -> bool {
        self.0.handler.read().is_some()
    }
}

impl PartialEq for EndpointHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EndpointHandle {}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.0.id)
            .field("service", &self.0.service)
            .field("anonymous", &self.0.anonymous)
            .field("local_addr", &self.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    #[test]
    fn test_datagram_text_is_lossy() {
        let datagram = Datagram::new(vec![b'h', b'i', 0xff], peer());
        assert_eq!(datagram.text(), "hi\u{fffd}");
        assert_eq!(datagram.len(), 3);
        assert_eq!(datagram.peer(), peer());
        assert!(!datagram.is_empty());
        assert!(Datagram::new(Vec::new(), peer()).is_empty());
    }

    #[test]
    fn test_reserved_endpoint_is_pending() {
        let endpoint = Endpoint::reserve(EndpointId::new(3), "1979", false);
        assert!(!endpoint.is_ready());
        assert!(!endpoint.is_failed());
        assert!(endpoint.with_socket(|_| ()).is_none());
        let handle = EndpointHandle::new(Arc::new(endpoint));
        assert!(handle.local_addr().is_err());
        assert_eq!(handle.id().as_usize(), 3);
    }

    #[test]
    fn test_attach_callback_last_writer_wins() {
        let handle = EndpointHandle::new(Arc::new(Endpoint::reserve(
            EndpointId::new(1),
            "0",
            true,
        )));
        assert!(!handle.has_callback());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        handle.attach_callback(
            |_, ctx: &Arc<AtomicUsize>| {
                ctx.fetch_add(1, Ordering::SeqCst);
            },
            Arc::clone(&first),
        );
        handle.attach_callback(
            |d, ctx: &Arc<AtomicUsize>| {
                ctx.fetch_add(d.len(), Ordering::SeqCst);
            },
            Arc::clone(&second),
        );

        let handler = handle.inner().handler().unwrap();
        handler(&Datagram::new(b"abcd".to_vec(), peer()));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 4);
    }

    fn refused(_: RawFd, _: EndpointId) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "registration refused"))
    }

    #[test]
    fn test_registration_failure_releases_socket() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = Endpoint::reserve(EndpointId::new(5), &port.to_string(), false);

        let err = endpoint
            .open_with(&BindConfig::default(), |fd, id| {
                assert!(fd >= 0);
                assert_eq!(id, EndpointId::new(5));
                refused(fd, id)
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::MultiplexerRegistrationFailed(_)));
        assert!(endpoint.is_failed());
        assert!(endpoint.with_socket(|_| ()).is_none());

        // Without SO_REUSEADDR this only succeeds if the failed socket was closed.
        std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
    }

    #[test]
    fn test_failed_record_is_reclaimed_once() {
        let endpoint = Endpoint::reserve(EndpointId::new(6), "0", true);
        assert!(!endpoint.try_reclaim());

        endpoint
            .open_with(&BindConfig::default(), refused)
            .unwrap_err();
        assert!(endpoint.try_reclaim());
        assert!(!endpoint.try_reclaim());
        assert!(!endpoint.is_failed());

        endpoint
            .open_with(&BindConfig::default(), |_, _| Ok(()))
            .unwrap();
        assert!(endpoint.is_ready());
        let handle = EndpointHandle::new(Arc::new(endpoint));
        assert_ne!(handle.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_wait_settled_returns_after_owner_finishes() {
        let endpoint = Arc::new(Endpoint::reserve(EndpointId::new(7), "0", true));
        let waiter = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || endpoint.wait_settled())
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        endpoint
            .open_with(&BindConfig::default(), |_, _| Ok(()))
            .unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let a = EndpointHandle::new(Arc::new(Endpoint::reserve(EndpointId::new(1), "0", true)));
        let b = EndpointHandle::new(Arc::new(Endpoint::reserve(EndpointId::new(1), "0", true)));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
