//! Readiness multiplexer built on `mio::Poll`.
//!
//! The [`Multiplexer`] half is owned by the dispatch thread and yields one
//! [`Readiness`] at a time. The [`Registrar`] half is shared with caller
//! threads: it adds read registrations and carries the cancellation token.
//!
//! `mio` has no timer source, so the keep-alive timer is driven by the poll
//! timeout: `wait` never sleeps past the next heartbeat deadline.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use netlog_config::log_mux_debug;

use crate::endpoint::EndpointId;

const WAKE_TOKEN: Token = Token(0);

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket registered under this id has data to read.
    Readable(EndpointId),
    /// The keep-alive timer elapsed.
    TimerFired,
    /// The cancellation token was triggered.
    Cancelled,
}

/// Cooperative stop signal observed by [`Multiplexer::wait`].
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl CancelToken {
    /// Mark the token cancelled and interrupt a blocked `wait`.
    pub fn cancel(&self) -> io::Result<()> {
        self.cancelled.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Heartbeat {
    interval: Duration,
    next: Instant,
}

/// Registration side of the multiplexer, safe to use from any thread.
pub struct Registrar {
    registry: mio::Registry,
    cancel: CancelToken,
}

impl Registrar {
    /// Add read interest for `fd`, tagged with `id`.
    ///
    /// Registrations are edge-triggered: the consumer must drain the socket
    /// until it reports `WouldBlock` after each `Readable`.
    pub fn register_read(&self, fd: RawFd, id: EndpointId) -> io::Result<()> {
        log_mux_debug!("Adding read interest", id = id.as_usize(), fd = fd);
        self.registry
            .register(&mut SourceFd(&fd), id.token(), Interest::READABLE)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Waiting side of the multiplexer.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    ready: VecDeque<Readiness>,
    heartbeat: Option<Heartbeat>,
    cancel: CancelToken,
}

impl Multiplexer {
    /// Create a poll instance and its registrar. `capacity` bounds the number
    /// of events fetched per system call.
    pub fn new(capacity: usize) -> io::Result<(Self, Registrar)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let cancel = CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?),
        };

        let mux = Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            ready: VecDeque::new(),
            heartbeat: None,
            cancel: cancel.clone(),
        };
        Ok((mux, Registrar { registry, cancel }))
    }

    /// Install the recurring keep-alive timer. A second call replaces the
    /// period of the first.
    pub fn register_timer(&mut self, interval: Duration) {
        self.heartbeat = Some(Heartbeat {
            interval,
            next: Instant::now() + interval,
        });
    }

    /// Re-arm the read registration of `fd`. A socket that still has data
    /// queued is reported again by the next `wait`.
    pub fn rearm(&self, fd: RawFd, id: EndpointId) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), id.token(), Interest::READABLE)
    }

    /// Block until one event is available.
    ///
    /// Cancellation takes precedence over queued readiness, and is reported
    /// again on every subsequent call.
    pub fn wait(&mut self) -> io::Result<Readiness> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Readiness::Cancelled);
            }
            if let Some(readiness) = self.ready.pop_front() {
                return Ok(readiness);
            }

            let timeout = match self.heartbeat.as_mut() {
                Some(heartbeat) => {
                    let now = Instant::now();
                    if now >= heartbeat.next {
                        heartbeat.next = now + heartbeat.interval;
                        return Ok(Readiness::TimerFired);
                    }
                    Some(heartbeat.next - now)
                }
                None => None,
            };

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in self.events.iter() {
                if event.token() != WAKE_TOKEN {
                    self.ready
                        .push_back(Readiness::Readable(EndpointId::from_token(event.token())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;
    use std::thread;

    #[test]
    fn test_readable_carries_tag() {
        let (mut mux, registrar) = Multiplexer::new(8).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        registrar
            .register_read(socket.as_raw_fd(), EndpointId::new(42))
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", socket.local_addr().unwrap()).unwrap();

        assert_eq!(
            mux.wait().unwrap(),
            Readiness::Readable(EndpointId::new(42))
        );
    }

    #[test]
    fn test_rearm_reports_undrained_socket_again() {
        let (mut mux, registrar) = Multiplexer::new(8).unwrap();
        mux.register_timer(Duration::from_millis(200));
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let id = EndpointId::new(7);
        registrar.register_read(socket.as_raw_fd(), id).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"one", socket.local_addr().unwrap()).unwrap();
        sender.send_to(b"two", socket.local_addr().unwrap()).unwrap();
        assert_eq!(mux.wait().unwrap(), Readiness::Readable(id));

        // Read only one of the two datagrams, then re-arm.
        let mut buf = [0u8; 16];
        socket.recv_from(&mut buf).unwrap();
        mux.rearm(socket.as_raw_fd(), id).unwrap();
        assert_eq!(mux.wait().unwrap(), Readiness::Readable(id));
    }

    #[test]
    fn test_timer_fires_repeatedly() {
        let (mut mux, _registrar) = Multiplexer::new(8).unwrap();
        mux.register_timer(Duration::from_millis(10));

        let start = Instant::now();
        assert_eq!(mux.wait().unwrap(), Readiness::TimerFired);
        assert_eq!(mux.wait().unwrap(), Readiness::TimerFired);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_interrupts_blocked_wait() {
        let (mut mux, registrar) = Multiplexer::new(8).unwrap();
        let token = registrar.cancel_token().clone();
        assert!(!token.is_cancelled());

        let waiter = thread::spawn(move || {
            let first = mux.wait().unwrap();
            let second = mux.wait().unwrap();
            (first, second)
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel().unwrap();

        let (first, second) = waiter.join().unwrap();
        assert_eq!(first, Readiness::Cancelled);
        assert_eq!(second, Readiness::Cancelled);
    }
}
