//! Bulk-transfer and lifecycle integration tests: positional completion
//! correlation, blocking submissions, resource reclamation on close, and
//! cancellation during shutdown.
//!
//! The tests play the remote DMA engine: bulk requests announce page lists
//! to the peer, and the peer answers with done messages once "the bytes
//! have moved".

mod common;

use std::time::Duration;

use common::{LONG, connected_pair, open_echo};
use vchiq_shm::{
    BulkBuffer, BulkDirection, BulkMode, Completion, DeliveryMode, LinkedPair, MessageType,
    QueueMode, TransportConfig, TransportError,
};

fn bulk_done(
    pair: &LinkedPair,
    direction: BulkDirection,
    peer_port: u16,
    local_port: u16,
    actual: u32,
) {
    pair.slave
        .send_message(
            direction.done_type(),
            peer_port,
            local_port,
            &actual.to_le_bytes(),
            QueueMode::Blocking,
        )
        .unwrap();
}

/// Completions correlate by position, not by anything in the done message:
/// out-of-order tokens come back in submission order.
#[test]
fn bulk_completions_are_positional() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);

    let buf_a = vec![1u8; 10_000];
    let buf_b = vec![2u8; 300];
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Transmit,
            BulkBuffer::from(buf_a.as_slice()),
            99,
            BulkMode::Callback,
        )
        .unwrap();
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Transmit,
            BulkBuffer::from(buf_b.as_slice()),
            7,
            BulkMode::Callback,
        )
        .unwrap();
    assert_eq!(pair.master_dma.active(), 2);

    bulk_done(&pair, BulkDirection::Transmit, 7, handle.port(), 10_000);
    bulk_done(&pair, BulkDirection::Transmit, 7, handle.port(), 300);

    let mut completions = Vec::new();
    while completions.len() < 2 {
        completions.extend(
            pair.master
                .await_completion(handle, 4, Some(LONG))
                .expect("bulk completions never arrived"),
        );
    }
    assert_eq!(
        completions[0],
        Completion::BulkDone {
            direction: BulkDirection::Transmit,
            token: 99,
            actual: 10_000,
        }
    );
    assert_eq!(
        completions[1],
        Completion::BulkDone {
            direction: BulkDirection::Transmit,
            token: 7,
            actual: 300,
        }
    );

    // Pins and fragments are back
    assert_eq!(pair.master_dma.active(), 0);
}

/// The two directions run independent FIFOs; interleaved completions must
/// land on the right queue.
#[test]
fn bulk_directions_are_independent() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);

    let tx_buf = vec![3u8; 512];
    let rx_buf = vec![0u8; 2048];
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Transmit,
            BulkBuffer::from(tx_buf.as_slice()),
            1,
            BulkMode::Callback,
        )
        .unwrap();
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Receive,
            BulkBuffer::from(rx_buf.as_slice()),
            2,
            BulkMode::Callback,
        )
        .unwrap();

    // Receive side completes first
    bulk_done(&pair, BulkDirection::Receive, 7, handle.port(), 2048);
    bulk_done(&pair, BulkDirection::Transmit, 7, handle.port(), 512);

    let mut completions = Vec::new();
    while completions.len() < 2 {
        completions.extend(pair.master.await_completion(handle, 4, Some(LONG)).unwrap());
    }
    assert!(completions.contains(&Completion::BulkDone {
        direction: BulkDirection::Receive,
        token: 2,
        actual: 2048,
    }));
    assert!(completions.contains(&Completion::BulkDone {
        direction: BulkDirection::Transmit,
        token: 1,
        actual: 512,
    }));
    assert_eq!(pair.master_dma.active(), 0);
}

#[test]
fn blocking_bulk_waits_for_its_own_completion() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);

    let submitter = {
        let master = pair.master.clone();
        std::thread::spawn(move || {
            let buf = vec![9u8; 4096];
            master.queue_bulk(
                handle,
                BulkDirection::Transmit,
                BulkBuffer::from(buf.as_slice()),
                42,
                BulkMode::Blocking,
            )
        })
    };

    // Give the submission time to land, then complete it
    std::thread::sleep(Duration::from_millis(100));
    bulk_done(&pair, BulkDirection::Transmit, 7, handle.port(), 4096);

    assert_eq!(submitter.join().unwrap(), Ok(()));
    assert_eq!(pair.master_dma.active(), 0);
}

/// NoCallback transfers produce no completion record but still release
/// their resources when the done message arrives.
#[test]
fn no_callback_bulk_reclaims_silently() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);

    let buf = vec![4u8; 128];
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Transmit,
            BulkBuffer::from(buf.as_slice()),
            0,
            BulkMode::NoCallback,
        )
        .unwrap();
    bulk_done(&pair, BulkDirection::Transmit, 7, handle.port(), 128);

    assert_eq!(
        pair.master
            .await_completion(handle, 4, Some(Duration::from_millis(200)))
            .unwrap_err(),
        TransportError::Timeout
    );
    assert_eq!(pair.master_dma.active(), 0);
}

#[test]
fn bulk_requires_an_open_service() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = pair
        .master
        .open_service(
            vchiq_shm::FourCc::from_bytes(b"cold"),
            1,
            DeliveryMode::Callback,
        )
        .unwrap();

    // Still Opening: no OPENACK was injected
    let buf = vec![0u8; 64];
    assert_eq!(
        pair.master
            .queue_bulk(
                handle,
                BulkDirection::Transmit,
                BulkBuffer::from(buf.as_slice()),
                0,
                BulkMode::Callback,
            )
            .unwrap_err(),
        TransportError::InvalidParameter
    );
}

/// Closing a service with queued messages and un-completed bulks must give
/// every resource back: buffer pins, fragments, and the port itself.
#[test]
fn close_purges_everything() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);
    let fragments_before = pair.master.fragments_free();

    // Queue messages the caller never collects
    for i in 0..3u8 {
        pair.slave
            .send_message(
                MessageType::Data,
                7,
                handle.port(),
                &[i; 32],
                QueueMode::Blocking,
            )
            .unwrap();
    }
    // And bulks the peer never completes
    let buf = vec![5u8; 8192];
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Transmit,
            BulkBuffer::from(buf.as_slice()),
            1,
            BulkMode::Callback,
        )
        .unwrap();
    pair.master
        .queue_bulk(
            handle,
            BulkDirection::Receive,
            BulkBuffer::from(buf.as_slice()),
            2,
            BulkMode::Callback,
        )
        .unwrap();
    assert_eq!(pair.master_dma.active(), 2);

    // Let the data messages land before closing, so the purge has queued
    // completions to drop
    std::thread::sleep(Duration::from_millis(100));
    pair.master.close_service(handle).unwrap();

    assert_eq!(pair.master_dma.active(), 0, "buffer pins leaked");
    assert_eq!(
        pair.master.fragments_free(),
        fragments_before,
        "fragments leaked"
    );

    // The handle is stale now
    assert_eq!(
        pair.master
            .queue_message(handle, b"late", QueueMode::Blocking)
            .unwrap_err(),
        TransportError::NotFound
    );
    assert_eq!(
        pair.master
            .await_completion(handle, 1, Some(Duration::from_millis(50)))
            .unwrap_err(),
        TransportError::NotFound
    );
    assert_eq!(
        pair.master.close_service(handle).unwrap_err(),
        TransportError::NotFound
    );
}

#[test]
fn remove_service_tears_down_like_close() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Dequeue, 7);

    pair.master.remove_service(handle).unwrap();
    assert_eq!(
        pair.master.dequeue_message(handle, false).unwrap_err(),
        TransportError::NotFound
    );
}

/// Shutdown must unblock every waiter with `Cancelled`.
#[test]
fn shutdown_cancels_blocked_callers() {
    let pair = connected_pair(&TransportConfig::default());
    let handle = open_echo(&pair, DeliveryMode::Callback, 7);

    let waiter = {
        let master = pair.master.clone();
        std::thread::spawn(move || master.await_completion(handle, 1, None))
    };
    std::thread::sleep(Duration::from_millis(100));

    pair.master.shutdown();
    assert_eq!(waiter.join().unwrap(), Err(TransportError::Cancelled));
}
