//! Wire transfer roundtrips for the wlog and wdiff pipelines.

use std::thread;

use walbak_proto::packet::Packet;
use walbak_proto::stream::Ctrl;
use walbak_types::error::WalbakError;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::compress::Codec;
use crate::diff::DiffRecord;
use crate::testutil::{normal_rec, random_blocks, tcp_pair};
use crate::wdiff_net::{recv_diff, send_diff};
use crate::wlog::{WlogPack, WlogPackBuilder};
use crate::wlog_net::{recv_wlog, send_wlog};

fn sample_packs(salt: u32) -> Vec<WlogPack> {
    let mut packs = Vec::new();
    let mut b = WlogPackBuilder::new(0, salt);
    b.add_write(0, random_blocks(4)).unwrap();
    b.add_write(100, random_blocks(1)).unwrap();
    let p = b.build();
    let mut b2 = WlogPackBuilder::new(p.end_lsid(), salt);
    b2.add_discard(50, 16);
    b2.add_write(8, random_blocks(2)).unwrap();
    packs.push(p);
    packs.push(b2.build());
    packs
}

#[test]
fn wlog_stream_roundtrip_over_tcp() {
    for codec in [Codec::AsIs, Codec::Snappy, Codec::Zlib, Codec::Xz] {
        let salt = 0x1234;
        let packs = sample_packs(salt);
        let expected = packs.clone();
        let (client, server) = tcp_pair();

        let sender = thread::spawn(move || {
            let mut iter = packs.into_iter();
            send_wlog(&client, codec, salt, move || Ok(iter.next()))
        });

        let mut received = Vec::new();
        recv_wlog(&server, salt, |pack| {
            received.push(pack);
            Ok(())
        })
        .unwrap();
        sender.join().unwrap().unwrap();

        assert_eq!(received.len(), expected.len());
        for (got, want) in received.iter().zip(&expected) {
            assert_eq!(got.header, want.header, "codec {codec:?}");
            assert_eq!(got.ios, want.ios);
        }
    }
}

#[test]
fn wlog_receiver_rejects_wrong_salt() {
    let packs = sample_packs(7);
    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut iter = packs.into_iter();
        send_wlog(&client, Codec::Snappy, 7, move || Ok(iter.next()))
    });
    let result = recv_wlog(&server, 8, |_| Ok(()));
    assert!(result.is_err());
    // The sender may or may not notice the teardown first; just join it.
    let _ = sender.join().unwrap();
}

#[test]
fn wdiff_stream_roundtrip_over_tcp() {
    let records = vec![
        normal_rec(0, random_blocks(4)),
        normal_rec(77, random_blocks(1)),
        crate::diff::RecIo::new(DiffRecord::discard(100, 8), Vec::new()),
    ];
    // Enough records to span multiple packs.
    let mut many = records.clone();
    for i in 0..70u64 {
        many.push(normal_rec(200 + i * 2, random_blocks(1)));
    }
    let expected = many.clone();

    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut iter = many.into_iter();
        send_diff(&client, Codec::Zlib, move || {
            Ok(iter.next().map(|r| (r.rec, r.data)))
        })
    });

    let mut received = Vec::new();
    recv_diff(&server, |rec, data| {
        received.push((rec, data));
        Ok(())
    })
    .unwrap();
    sender.join().unwrap().unwrap();

    assert_eq!(received.len(), expected.len());
    for ((rec, data), want) in received.iter().zip(&expected) {
        assert_eq!(*rec, want.rec);
        assert_eq!(*data, want.data);
        if rec.kind == crate::diff::DiffRecKind::Normal {
            assert_eq!(data.len(), rec.io_blocks as usize * LOGICAL_BLOCK_SIZE);
        }
    }
}

#[test]
fn error_control_byte_fails_the_receiver() {
    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut pkt = Packet::new(&client);
        pkt.write_ctrl(Ctrl::Error).unwrap();
        pkt.flush().unwrap();
    });
    let result = recv_diff(&server, |_, _| Ok(()));
    match result {
        Err(WalbakError::Protocol(msg)) => assert!(msg.contains("error")),
        other => panic!("expected protocol error, got {other:?}"),
    }
    sender.join().unwrap();
}

#[test]
fn failing_consumer_unblocks_the_sender() {
    let mut records = Vec::new();
    for i in 0..500u64 {
        records.push(normal_rec(i * 4, random_blocks(2)));
    }
    let (client, server) = tcp_pair();
    let sender = thread::spawn(move || {
        let mut iter = records.into_iter();
        send_diff(&client, Codec::AsIs, move || {
            Ok(iter.next().map(|r| (r.rec, r.data)))
        })
    });
    let result = recv_diff(&server, |_, _| {
        Err(WalbakError::Other("consumer gave up".into()))
    });
    assert!(result.is_err());
    drop(server);
    // The sender must terminate (with either success or a socket error),
    // not hang on a full queue.
    let _ = sender.join().unwrap();
}
