use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while initializing the registry or creating endpoints
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry is already initialized")]
    AlreadyInitialized,

    #[error("registry is not initialized")]
    NotInitialized,

    #[error("socket(): {0}")]
    SocketCreationFailed(#[source] io::Error),

    #[error("setsockopt({option}): {source}")]
    SocketOptionFailed {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("getaddrinfo({service}): {message}")]
    AddressResolutionFailed {
        service: String,
        code: i32,
        message: String,
    },

    #[error("bind({service} -> {addr}): {source}")]
    BindFailed {
        service: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create poll instance: {0}")]
    MultiplexerCreationFailed(#[source] io::Error),

    #[error("failed to register with poll instance: {0}")]
    MultiplexerRegistrationFailed(#[source] io::Error),

    #[error("failed to spawn dispatch thread: {0}")]
    DispatchSpawnFailed(#[source] io::Error),

    #[error("dispatch thread panicked")]
    DispatchPanicked,
}

impl RegistryError {
    /// Numeric code in the style of errno / resolver status. 0 when the error
    /// has no OS counterpart.
    pub fn code(&self) -> i32 {
        match self {
            RegistryError::SocketCreationFailed(e)
            | RegistryError::SocketOptionFailed { source: e, .. }
            | RegistryError::BindFailed { source: e, .. }
            | RegistryError::MultiplexerCreationFailed(e)
            | RegistryError::MultiplexerRegistrationFailed(e)
            | RegistryError::DispatchSpawnFailed(e) => e.raw_os_error().unwrap_or(0),
            RegistryError::AddressResolutionFailed { code, .. } => *code,
            RegistryError::AlreadyInitialized
            | RegistryError::NotInitialized
            | RegistryError::DispatchPanicked => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_from_os_error() {
        let err = RegistryError::SocketOptionFailed {
            option: "SO_REUSEADDR",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert_eq!(err.code(), libc::EINVAL);
        assert!(err.to_string().starts_with("setsockopt(SO_REUSEADDR)"));
    }

    #[test]
    fn test_code_without_os_counterpart() {
        assert_eq!(RegistryError::AlreadyInitialized.code(), 0);
        assert_eq!(
            RegistryError::AlreadyInitialized.to_string(),
            "registry is already initialized"
        );
    }
}
