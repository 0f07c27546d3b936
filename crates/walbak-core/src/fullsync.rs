//! Dirty full sync data plane.
//!
//! The client streams the volume's whole logical extent in `bulk_lb` pieces,
//! each compressed and framed as one chunk; the server decompresses,
//! verifies the size and writes. Point-in-time consistency is not required:
//! later wlogs re-apply any write that raced the copy. Both loops poll for
//! force stop every iteration and abort leaving the transient state for the
//! operator.

use std::io::{Read, Write};

use tracing::info;

use walbak_proto::packet::Packet;
use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::Gid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::compress::{Codec, CompressedChunk};
use crate::throughput::ThroughputStabilizer;

/// Outcome of a data-plane loop: completed, or aborted by force stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Done,
    Aborted,
}

/// Client side: read `size_lb` blocks via `read_bulk` and stream them.
pub fn send_full_image<S, F, A>(
    pkt: &mut Packet<S>,
    mut read_bulk: F,
    size_lb: u64,
    bulk_lb: u64,
    codec: Codec,
    should_abort: A,
    mut stabilizer: Option<&mut ThroughputStabilizer>,
) -> Result<SyncOutcome>
where
    S: Read + Write,
    F: FnMut(&mut [u8]) -> Result<()>,
    A: Fn() -> bool,
{
    verify_bulk_lb(bulk_lb)?;
    let mut buf = vec![0u8; bulk_lb as usize * LOGICAL_BLOCK_SIZE];
    let mut remaining_lb = size_lb;
    let mut packets = 0u64;
    while remaining_lb > 0 {
        if should_abort() {
            return Ok(SyncOutcome::Aborted);
        }
        let lb = bulk_lb.min(remaining_lb);
        let size = lb as usize * LOGICAL_BLOCK_SIZE;
        read_bulk(&mut buf[..size])?;
        let chunk = CompressedChunk::plain(buf[..size].to_vec())?.compress(codec)?;
        chunk.send(pkt)?;
        remaining_lb -= lb;
        packets += 1;
        if let Some(st) = stabilizer.as_deref_mut() {
            st.add_and_sleep_if_necessary(lb, 10, 1000);
        }
    }
    pkt.flush()?;
    info!(packets, "full image sent");
    Ok(SyncOutcome::Done)
}

/// Server side: receive `size_lb` blocks into `out`.
pub fn recv_full_image<S, W, A>(
    pkt: &mut Packet<S>,
    out: &mut W,
    size_lb: u64,
    bulk_lb: u64,
    should_abort: A,
) -> Result<SyncOutcome>
where
    S: Read + Write,
    W: Write,
    A: Fn() -> bool,
{
    verify_bulk_lb(bulk_lb)?;
    let mut remaining_lb = size_lb;
    let mut packets = 0u64;
    while remaining_lb > 0 {
        if should_abort() {
            return Ok(SyncOutcome::Aborted);
        }
        let lb = bulk_lb.min(remaining_lb);
        let size = lb as usize * LOGICAL_BLOCK_SIZE;
        let chunk = CompressedChunk::recv(pkt)?.uncompress()?;
        if chunk.data().len() != size {
            return Err(WalbakError::Protocol(format!(
                "full sync chunk of {} bytes, expected {size}",
                chunk.data().len()
            )));
        }
        out.write_all(chunk.data())?;
        remaining_lb -= lb;
        packets += 1;
    }
    out.flush()?;
    info!(packets, "full image received");
    Ok(SyncOutcome::Done)
}

/// The terminal snapshot pair bounding the post-copy consistent point.
pub fn send_gid_pair<S: Read + Write>(pkt: &mut Packet<S>, gid_b: Gid, gid_e: Gid) -> Result<()> {
    pkt.write(&gid_b)?;
    pkt.write(&gid_e)?;
    pkt.flush()
}

pub fn recv_gid_pair<S: Read + Write>(pkt: &mut Packet<S>) -> Result<(Gid, Gid)> {
    let gid_b: Gid = pkt.read()?;
    let gid_e: Gid = pkt.read()?;
    if gid_b > gid_e {
        return Err(WalbakError::Protocol(format!(
            "inverted gid pair {gid_b} > {gid_e}"
        )));
    }
    Ok((gid_b, gid_e))
}

fn verify_bulk_lb(bulk_lb: u64) -> Result<()> {
    if bulk_lb == 0 || bulk_lb > walbak_types::MAX_BULK_LB {
        return Err(WalbakError::BadRequest(format!("bad bulkLb {bulk_lb}")));
    }
    Ok(())
}
