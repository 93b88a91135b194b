//! The process-wide facade. Kept in its own test binary so the global
//! registry starts uninitialized.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use netlog_config::Config;
use netlog_server::{global, RegistryError};

#[test]
fn test_global_lifecycle() {
    assert!(matches!(
        global::create_or_get(None),
        Err(RegistryError::NotInitialized)
    ));

    let mut config = Config::default();
    config.registry.heartbeat_interval_ms = 0;
    global::initialize(&config).unwrap();
    assert!(matches!(
        global::initialize(&config),
        Err(RegistryError::AlreadyInitialized)
    ));

    let one = global::create_or_get(None).unwrap();
    let three = global::create_or_get(None).unwrap();
    assert_ne!(one, three);

    let (tx, rx) = crossbeam_channel::unbounded();
    global::attach_callback(
        &one,
        |datagram, tx: &crossbeam_channel::Sender<String>| {
            tx.send(datagram.text().into_owned()).unwrap();
        },
        tx,
    );

    let port = one.local_addr().unwrap().port();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"Init successful\n", (Ipv4Addr::LOCALHOST, port)).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "Init successful\n"
    );

    assert_eq!(global::registry().unwrap().endpoint_count(), 2);
    global::stop().unwrap();
}
