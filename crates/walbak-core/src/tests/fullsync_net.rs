use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use walbak_proto::packet::Packet;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::compress::Codec;
use crate::fullsync::{
    recv_full_image, recv_gid_pair, send_full_image, send_gid_pair, SyncOutcome,
};
use crate::testutil::{random_blocks, tcp_pair};

#[test]
fn full_image_roundtrip() {
    let size_lb = 100u64;
    let bulk_lb = 7u64; // uneven on purpose: a short final bulk
    let image = random_blocks(size_lb as usize);
    let expected = image.clone();

    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut pkt = Packet::new(&client);
        let mut off = 0usize;
        let outcome = send_full_image(
            &mut pkt,
            |buf: &mut [u8]| {
                buf.copy_from_slice(&image[off..off + buf.len()]);
                off += buf.len();
                Ok(())
            },
            size_lb,
            bulk_lb,
            Codec::Snappy,
            || false,
            None,
        )?;
        send_gid_pair(&mut pkt, 0, 1)?;
        pkt.recv_ack()?;
        Ok::<_, walbak_types::error::WalbakError>(outcome)
    });

    let mut pkt = Packet::new(&server);
    let mut out = Vec::new();
    let outcome = recv_full_image(&mut pkt, &mut out, size_lb, bulk_lb, || false).unwrap();
    assert_eq!(outcome, SyncOutcome::Done);
    let (gid_b, gid_e) = recv_gid_pair(&mut pkt).unwrap();
    pkt.send_ack().unwrap();

    assert_eq!((gid_b, gid_e), (0, 1));
    assert_eq!(out.len(), size_lb as usize * LOGICAL_BLOCK_SIZE);
    assert_eq!(out, expected);
    assert_eq!(sender.join().unwrap().unwrap(), SyncOutcome::Done);
}

#[test]
fn force_stop_aborts_within_one_bulk() {
    let size_lb = 1000u64;
    let bulk_lb = 4u64;
    let image = random_blocks(size_lb as usize);
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);

    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut pkt = Packet::new(&client);
        let mut off = 0usize;
        let mut sent_bulks = 0u64;
        let outcome = send_full_image(
            &mut pkt,
            |buf: &mut [u8]| {
                buf.copy_from_slice(&image[off..off + buf.len()]);
                off += buf.len();
                sent_bulks += 1;
                if sent_bulks == 10 {
                    stop2.store(true, Ordering::Release);
                }
                Ok(())
            },
            size_lb,
            bulk_lb,
            Codec::AsIs,
            || stop2.load(Ordering::Acquire),
            None,
        )?;
        Ok::<_, walbak_types::error::WalbakError>((outcome, sent_bulks))
    });

    let mut pkt = Packet::new(&server);
    let mut out = Vec::new();
    let _ = recv_full_image(&mut pkt, &mut out, size_lb, bulk_lb, || {
        stop.load(Ordering::Acquire)
    });

    let (outcome, sent_bulks) = sender.join().unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Aborted);
    // The abort lands at the next checkpoint: one bulk after the flag.
    assert_eq!(sent_bulks, 10);
}

#[test]
fn corrupt_size_is_a_protocol_error() {
    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut pkt = Packet::new(&client);
        // Claim 4 blocks but send 1.
        let chunk =
            crate::compress::CompressedChunk::plain(random_blocks(1)).unwrap();
        chunk.send(&mut pkt).unwrap();
        pkt.flush().unwrap();
    });
    let mut pkt = Packet::new(&server);
    let mut out = Vec::new();
    let result = recv_full_image(&mut pkt, &mut out, 4, 4, || false);
    assert!(result.is_err());
    sender.join().unwrap();
}
