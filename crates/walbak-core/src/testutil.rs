use std::net::{TcpListener, TcpStream};
use std::path::Path;

use rand::RngCore;

use walbak_types::gid::Snap;
use walbak_types::uuid::Uuid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::diff::{DiffFileHeader, DiffRecKind, DiffRecord, DiffWriter, RecIo};
use crate::meta::MetaDiff;

/// A connected localhost socket pair.
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

pub fn random_blocks(blocks: usize) -> Vec<u8> {
    let mut data = vec![0u8; blocks * LOGICAL_BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Write a wdiff file containing `records` for the snap range `b -> e`.
pub fn write_wdiff_file(
    path: &Path,
    uuid: Uuid,
    snap_b: Snap,
    snap_e: Snap,
    records: &[RecIo],
) -> MetaDiff {
    let diff = MetaDiff::new(snap_b, snap_e, 1000, 0).unwrap();
    let max_io_blocks = records.iter().map(|r| r.rec.io_blocks).max().unwrap_or(0);
    let mut w = DiffWriter::new(std::fs::File::create(path).unwrap());
    w.write_header(&DiffFileHeader {
        uuid,
        max_io_blocks,
        diff,
    })
    .unwrap();
    for rio in records {
        w.add_record(rio.rec, rio.data.clone()).unwrap();
    }
    w.finish().unwrap();
    diff
}

pub fn normal_rec(addr: u64, data: Vec<u8>) -> RecIo {
    RecIo::new(DiffRecord::normal(addr, &data).unwrap(), data)
}

/// Apply diff records onto an in-memory image, the reference semantics the
/// scanner and merger are checked against.
pub fn apply_records(image: &mut [u8], records: &[RecIo]) {
    for rio in records {
        let off = rio.rec.io_address as usize * LOGICAL_BLOCK_SIZE;
        let len = rio.rec.io_blocks as usize * LOGICAL_BLOCK_SIZE;
        if off >= image.len() {
            continue;
        }
        let len = len.min(image.len() - off);
        match rio.rec.kind {
            DiffRecKind::Normal => image[off..off + len].copy_from_slice(&rio.data[..len]),
            DiffRecKind::Discard | DiffRecKind::AllZero => image[off..off + len].fill(0),
        }
    }
}
