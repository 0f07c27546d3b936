//! Pipelined wdiff record transfer over a socket.
//!
//! The unit on the wire is one encoded diff pack (up to 32 records plus
//! payloads) carried as a compressed chunk under stream control. The file
//! header does not travel here; both sides derive it from the negotiated
//! transfer parameters.

use std::net::TcpStream;

use walbak_types::error::{Result, WalbakError};

use walbak_proto::packet::Packet;
use walbak_proto::stream::{try_send_error, Ctrl};

use crate::compress::{compress_worker, uncompress_worker, Codec, CompressedChunk};
use crate::diff::format::{decode_pack, encode_pack, DiffRecord, MAX_PACK_RECORDS};
use crate::queue::{BoundedQueue, DEFAULT_QUEUE_DEPTH};
use crate::task::{first_error, join_stage};

/// Send diff records drawn from `next_record` until it yields `None`.
pub fn send_diff<F>(sock: &TcpStream, codec: Codec, mut next_record: F) -> Result<()>
where
    F: FnMut() -> Result<Option<(DiffRecord, Vec<u8>)>>,
{
    let q0 = BoundedQueue::new(DEFAULT_QUEUE_DEPTH);
    let q1 = BoundedQueue::new(DEFAULT_QUEUE_DEPTH);

    std::thread::scope(|s| {
        let compressor = s.spawn(|| compress_worker(&q0, &q1, codec));
        let sender = s.spawn(|| {
            let mut pkt = Packet::new(sock);
            let result = (|| {
                while let Some(chunk) = q1.pop()? {
                    pkt.write_ctrl(Ctrl::Next)?;
                    chunk.send(&mut pkt)?;
                }
                pkt.write_ctrl(Ctrl::End)?;
                pkt.flush()?;
                Ok(())
            })();
            if result.is_err() {
                q1.fail();
                try_send_error(&mut pkt);
            }
            result
        });

        let producer = (|| {
            let mut pack: Vec<(DiffRecord, Vec<u8>)> = Vec::with_capacity(MAX_PACK_RECORDS);
            loop {
                let item = next_record()?;
                match item {
                    Some(rec_io) => {
                        pack.push(rec_io);
                        if pack.len() == MAX_PACK_RECORDS {
                            q0.push(CompressedChunk::plain(encode_pack(&pack)?)?)?;
                            pack.clear();
                        }
                    }
                    None => {
                        if !pack.is_empty() {
                            q0.push(CompressedChunk::plain(encode_pack(&pack)?)?)?;
                        }
                        q0.sync();
                        return Ok(());
                    }
                }
            }
        })();
        if producer.is_err() {
            q0.fail();
        }

        let comp = join_stage(compressor, "compressor");
        let send = join_stage(sender, "sender");
        first_error(vec![
            ("producer", producer),
            ("compressor", comp),
            ("sender", send),
        ])
    })
}

/// Receive diff records, handing each to `on_record`.
pub fn recv_diff<F>(sock: &TcpStream, mut on_record: F) -> Result<()>
where
    F: FnMut(DiffRecord, Vec<u8>) -> Result<()>,
{
    let q0 = BoundedQueue::new(DEFAULT_QUEUE_DEPTH);
    let q1 = BoundedQueue::new(DEFAULT_QUEUE_DEPTH);

    std::thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut pkt = Packet::new(sock);
            let result = (|| loop {
                match pkt.read_ctrl()? {
                    Ctrl::Next => q0.push(CompressedChunk::recv(&mut pkt)?)?,
                    Ctrl::End => {
                        q0.sync();
                        return Ok(());
                    }
                    Ctrl::Error => {
                        return Err(WalbakError::Protocol("peer signalled an error".into()))
                    }
                }
            })();
            if result.is_err() {
                q0.fail();
            }
            result
        });
        let uncompressor = s.spawn(|| uncompress_worker(&q0, &q1));

        let consumer = (|| {
            while let Some(chunk) = q1.pop()? {
                for (rec, data) in decode_pack(chunk.data())? {
                    on_record(rec, data)?;
                }
            }
            Ok(())
        })();
        if consumer.is_err() {
            q1.fail();
        }

        let recv = join_stage(receiver, "receiver");
        let unc = join_stage(uncompressor, "uncompressor");
        first_error(vec![
            ("consumer", consumer),
            ("receiver", recv),
            ("uncompressor", unc),
        ])
    })
}
