//! Pipelined wlog transfer over a socket.
//!
//! Sender: producer -> compressor -> socket. Receiver: socket ->
//! uncompressor -> consumer. Bounded queues are the only coupling between
//! the stages; a failing stage fails its input, fails or syncs its output,
//! and the supervisor reports the first error.

use std::net::TcpStream;

use walbak_types::error::{Result, WalbakError};

use walbak_proto::packet::Packet;
use walbak_proto::stream::{try_send_error, Ctrl};

use crate::compress::{compress_worker, uncompress_worker, Codec, CompressedChunk};
use crate::queue::{BoundedQueue, DEFAULT_QUEUE_DEPTH};
use crate::task::{first_error, join_stage};
use crate::wlog::{verify_wlog_io, WlogPack, WlogPackHeader};

/// Send wlog packs drawn from `next_pack` until it yields `None`.
pub fn send_wlog<F>(sock: &TcpStream, codec: Codec, salt: u32, mut next_pack: F) -> Result<()>
where
    F: FnMut() -> Result<Option<WlogPack>>,
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
            while let Some(pack) = next_pack()? {
                q0.push(CompressedChunk::plain(pack.header.encode(salt))?)?;
                for (rec, data) in pack.header.records.iter().zip(pack.ios) {
                    if rec.has_data() {
                        q0.push(CompressedChunk::plain(data)?)?;
                    }
                }
            }
            q0.sync();
            Ok(())
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

/// Receive wlog packs, handing each to `on_pack`.
pub fn recv_wlog<F>(sock: &TcpStream, salt: u32, mut on_pack: F) -> Result<()>
where
    F: FnMut(WlogPack) -> Result<()>,
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
            loop {
                let Some(head_chunk) = q1.pop()? else {
                    return Ok(());
                };
                let header = WlogPackHeader::decode(head_chunk.data(), salt)?;
                let mut ios = Vec::with_capacity(header.records.len());
                for rec in &header.records {
                    if rec.has_data() {
                        let chunk = q1.pop()?.ok_or_else(|| {
                            WalbakError::Protocol("wlog stream ended inside a pack".into())
                        })?;
                        let data = chunk.into_data();
                        verify_wlog_io(rec, &data, salt)?;
                        ios.push(data);
                    } else {
                        ios.push(Vec::new());
                    }
                }
                on_pack(WlogPack { header, ios })?;
            }
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
