#![allow(dead_code)]

//! Shared helpers for the integration suites: a connected pair over one
//! heap region, and peer-side service emulation (the tests play the remote
//! endpoint by injecting protocol messages directly).

use std::time::Duration;

use vchiq_shm::{
    DeliveryMode, FourCc, LinkedPair, MessageType, QueueMode, ServiceHandle, Transport,
    TransportConfig, TransportError, create_linked_pair,
};

pub const LONG: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bring up both sides of a fresh pair and complete the connect handshake.
pub fn connected_pair(config: &TransportConfig) -> LinkedPair {
    init_logging();
    let pair = create_linked_pair(config).expect("pair");
    pair.master.connect().expect("master connect");
    pair.slave.connect().expect("slave connect");
    pair.master.wait_connected(Some(LONG)).expect("master up");
    pair.slave.wait_connected(Some(LONG)).expect("slave up");
    pair
}

/// Open a service on the master and acknowledge it from the slave side, the
/// way a remote endpoint listening on `peer_port` would.
pub fn open_echo(pair: &LinkedPair, delivery: DeliveryMode, peer_port: u16) -> ServiceHandle {
    let handle = pair
        .master
        .open_service(FourCc::from_bytes(b"echo"), 3, delivery)
        .expect("open");
    pair.slave
        .send_message(
            MessageType::OpenAck,
            peer_port,
            handle.port(),
            &3u16.to_le_bytes(),
            QueueMode::Blocking,
        )
        .expect("openack");
    pair.master.await_open(handle, Some(LONG)).expect("acked");
    handle
}

/// Poll the pull-style queue until a message shows up.
pub fn dequeue_with_retry(transport: &Transport, handle: ServiceHandle) -> Vec<u8> {
    for _ in 0..1000 {
        match transport.dequeue_message(handle, false) {
            Ok(payload) => return payload,
            Err(TransportError::NoMoreEntries) => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("dequeue failed: {e}"),
        }
    }
    panic!("message never arrived");
}
