//! Service-name resolution and UDP socket binding.
//!
//! A service is either a numeric port or a name from the services database
//! (`/etc/services`), resolved with `getaddrinfo` the same way a passive
//! listener would. Sockets are bound to every local address: dual-stack IPv6
//! when available, IPv4 otherwise.

use std::ffi::{CStr, CString};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::ptr;

use netlog_config::{log_registry_debug, BindConfig};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{RegistryError, Result};

/// Resolve a service name to a UDP port.
pub fn resolve_port(service: &str) -> Result<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }

    let c_service =
        CString::new(service).map_err(|_| resolution_error(service, libc::EAI_NONAME))?;

    // Safety: zeroed addrinfo is the documented "no hints" baseline.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = libc::AI_PASSIVE;
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_DGRAM;
    hints.ai_protocol = libc::IPPROTO_UDP;

    let mut info: *mut libc::addrinfo = ptr::null_mut();
    let status = unsafe { libc::getaddrinfo(ptr::null(), c_service.as_ptr(), &hints, &mut info) };
    if status != 0 {
        return Err(resolution_error(service, status));
    }

    let port = unsafe { first_port(info) };
    unsafe { libc::freeaddrinfo(info) };

    port.ok_or_else(|| resolution_error(service, libc::EAI_SERVICE))
}

/// Walk an addrinfo list and return the port of the first inet entry.
///
/// # Safety
/// `info` must be null or a list returned by `getaddrinfo` that is still alive.
unsafe fn first_port(info: *const libc::addrinfo) -> Option<u16> {
    let mut current = info;
    while !current.is_null() {
        let entry = &*current;
        if !entry.ai_addr.is_null() {
            match entry.ai_family {
                libc::AF_INET6 => {
                    let addr = &*(entry.ai_addr as *const libc::sockaddr_in6);
                    return Some(u16::from_be(addr.sin6_port));
                }
                libc::AF_INET => {
                    let addr = &*(entry.ai_addr as *const libc::sockaddr_in);
                    return Some(u16::from_be(addr.sin_port));
                }
                _ => {}
            }
        }
        current = entry.ai_next;
    }
    None
}

fn resolution_error(service: &str, code: i32) -> RegistryError {
    // Safety: gai_strerror returns a static NUL-terminated string.
    let message = unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned();
    RegistryError::AddressResolutionFailed {
        service: service.to_string(),
        code,
        message,
    }
}

/// Bind a non-blocking UDP socket for `service` on all local addresses.
pub fn bind_service(service: &str, config: &BindConfig) -> Result<UdpSocket> {
    let port = resolve_port(service)?;

    if config.dual_stack {
        let addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port);
        match bind_addr(service, addr, config) {
            Ok(socket) => return Ok(socket),
            Err(e) if ipv6_unavailable(&e) => {
                log_registry_debug!(
                    "IPv6 unavailable, falling back to IPv4",
                    service = service,
                    error = tracing::field::display(&e),
                );
            }
            Err(e) => return Err(e),
        }
    }

    bind_addr(service, SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), config)
}

fn bind_addr(service: &str, addr: SocketAddr, config: &BindConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(RegistryError::SocketCreationFailed)?;

    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|source| option_error("IPV6_V6ONLY", source))?;
    }
    if config.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|source| option_error("SO_REUSEADDR", source))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|source| option_error("O_NONBLOCK", source))?;

    // On failure the socket is dropped here, which closes it.
    socket
        .bind(&addr.into())
        .map_err(|source| RegistryError::BindFailed {
            service: service.to_string(),
            addr,
            source,
        })?;

    Ok(socket.into())
}

fn option_error(option: &'static str, source: io::Error) -> RegistryError {
    RegistryError::SocketOptionFailed { option, source }
}

fn ipv6_unavailable(err: &RegistryError) -> bool {
    match err {
        RegistryError::SocketCreationFailed(_) => true,
        RegistryError::SocketOptionFailed {
            option: "IPV6_V6ONLY",
            ..
        } => true,
        RegistryError::BindFailed { source, .. } => {
            source.kind() == io::ErrorKind::AddrNotAvailable
        }
        _ => false,
    }
}
