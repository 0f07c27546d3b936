//! Read-ahead block-device source for the full sync producer.
//!
//! A byte ring buffer is partitioned into free, submitted-but-not-completed
//! and completed-but-not-read regions. The reader keeps a queue of in-flight
//! read descriptors covering the submitted region; descriptors are satisfied
//! positionally when the consumer needs data. The engine actually issuing
//! device reads sits below this interface and is swappable.

use std::collections::VecDeque;
use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;

use walbak_types::error::{Result, WalbakError};

pub const DEFAULT_BUFFER_SIZE: usize = 4 << 20;
pub const DEFAULT_MAX_IO_SIZE: usize = 64 << 10;

/// Physical block granularity of submitted reads.
const PBS: usize = 512;

/// Ring buffer for strictly sequential reads.
///
/// ```text
/// |___XXXXXXYYYYYYYYYY______|
///     ^     ^         ^
///     |     completed  ahead_off
///     read_off
/// ___ free, XXX completed not read, YYY submitted not completed
/// ```
pub struct RingBufferForSeqRead {
    buf: Vec<u8>,
    ahead_off: usize,
    read_off: usize,
    /// Bytes submitted but not completed.
    pending: usize,
    /// Bytes completed but not read.
    readable: usize,
}

impl RingBufferForSeqRead {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(WalbakError::BadRequest("ring buffer size must not be 0".into()));
        }
        Ok(RingBufferForSeqRead {
            buf: vec![0u8; size],
            ahead_off: 0,
            read_off: 0,
            pending: 0,
            readable: 0,
        })
    }

    pub fn free_size(&self) -> usize {
        self.buf.len() - self.pending - self.readable
    }

    /// Contiguous free space up to the right edge.
    pub fn available_size(&self) -> usize {
        self.free_size().min(self.buf.len() - self.ahead_off)
    }

    pub fn readable_size(&self) -> usize {
        self.readable
    }

    /// Reserve `size` bytes for an in-flight read.
    pub fn prepare(&mut self, size: usize) -> Range<usize> {
        assert!(size > 0 && size <= self.available_size());
        let range = self.ahead_off..self.ahead_off + size;
        self.ahead_off = (self.ahead_off + size) % self.buf.len();
        self.pending += size;
        range
    }

    /// Fill a reserved range and mark it readable.
    pub fn fill<F>(&mut self, range: Range<usize>, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let len = range.len();
        f(&mut self.buf[range])?;
        debug_assert!(len <= self.pending);
        self.pending -= len;
        self.readable += len;
        Ok(())
    }

    /// Copy up to `data.len()` readable bytes out, advancing the cursor.
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        let n = data.len().min(self.readable);
        let first = n.min(self.buf.len() - self.read_off);
        data[..first].copy_from_slice(&self.buf[self.read_off..self.read_off + first]);
        if first < n {
            data[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.read_off = (self.read_off + n) % self.buf.len();
        self.readable -= n;
        n
    }

    /// Advance the cursor without copying.
    pub fn skip(&mut self, size: usize) -> usize {
        let n = size.min(self.readable);
        self.read_off = (self.read_off + n) % self.buf.len();
        self.readable -= n;
        n
    }
}

struct IoDesc {
    range: Range<usize>,
    dev_off: u64,
}

/// Sequential reader with a full read-ahead queue over the ring buffer.
pub struct SeqBdevReader {
    file: File,
    dev_off: u64,
    dev_total: u64,
    max_io_size: usize,
    ring: RingBufferForSeqRead,
    io_q: VecDeque<IoDesc>,
}

impl SeqBdevReader {
    pub fn open(path: &Path, offset_lb: u64, buffer_size: usize, max_io_size: usize) -> Result<Self> {
        if buffer_size < max_io_size {
            return Err(WalbakError::BadRequest(format!(
                "buffer size {buffer_size} must cover max IO size {max_io_size}"
            )));
        }
        if max_io_size == 0 || max_io_size % PBS != 0 || buffer_size % PBS != 0 {
            return Err(WalbakError::BadRequest(
                "buffer and IO sizes must be multiples of the physical block size".into(),
            ));
        }
        let file = File::open(path)?;
        let dev_total = file.metadata()?.len();
        if dev_total % PBS as u64 != 0 {
            return Err(WalbakError::InvalidFormat(format!(
                "device size {dev_total} is not block aligned"
            )));
        }
        let mut reader = SeqBdevReader {
            file,
            dev_off: offset_lb * walbak_types::LOGICAL_BLOCK_SIZE as u64,
            dev_total,
            max_io_size,
            ring: RingBufferForSeqRead::new(buffer_size)?,
            io_q: VecDeque::new(),
        };
        reader.read_ahead();
        Ok(reader)
    }

    pub fn size_lb(&self) -> u64 {
        self.dev_total / walbak_types::LOGICAL_BLOCK_SIZE as u64
    }

    /// Fill `data` completely; errors once the device is exhausted.
    pub fn read(&mut self, data: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < data.len() {
            if self.ring.readable_size() == 0 {
                self.wait_for_io()?;
            }
            filled += self.ring.read(&mut data[filled..]);
            self.read_ahead();
        }
        Ok(())
    }

    fn decide_io_size(&self) -> usize {
        let remaining = (self.dev_total - self.dev_off) as usize;
        let size = self
            .max_io_size
            .min(self.ring.available_size())
            .min(remaining);
        size - size % PBS
    }

    fn prepare_ahead_io(&mut self) -> bool {
        if self.dev_off >= self.dev_total {
            return false;
        }
        let size = self.decide_io_size();
        if size == 0 {
            return false;
        }
        let range = self.ring.prepare(size);
        self.io_q.push_back(IoDesc {
            range,
            dev_off: self.dev_off,
        });
        self.dev_off += size as u64;
        true
    }

    /// Keep the in-flight queue full until the buffer fills or the device
    /// ends.
    fn read_ahead(&mut self) {
        while self.prepare_ahead_io() {}
    }

    /// Satisfy the oldest in-flight read.
    fn wait_for_io(&mut self) -> Result<()> {
        let desc = self.io_q.pop_front().ok_or_else(|| {
            WalbakError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past the device end",
            ))
        })?;
        let file = &self.file;
        let off = desc.dev_off;
        self.ring
            .fill(desc.range, |buf| {
                file.read_exact_at(buf, off)?;
                Ok(())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ring_basic_cycle() {
        let mut ring = RingBufferForSeqRead::new(16).unwrap();
        assert_eq!(ring.available_size(), 16);
        let r = ring.prepare(8);
        assert_eq!(r, 0..8);
        assert_eq!(ring.readable_size(), 0);
        ring.fill(r, |buf| {
            buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
            Ok(())
        })
        .unwrap();
        assert_eq!(ring.readable_size(), 8);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.skip(2), 2);
        let mut rest = [0u8; 4];
        assert_eq!(ring.read(&mut rest), 2);
        assert_eq!(&rest[..2], &[7, 8]);
    }

    #[test]
    fn ring_right_edge_limits_available() {
        let mut ring = RingBufferForSeqRead::new(16).unwrap();
        let r = ring.prepare(12);
        ring.fill(r, |b| {
            b.fill(9);
            Ok(())
        })
        .unwrap();
        let mut sink = [0u8; 8];
        ring.read(&mut sink);
        // 12 free bytes total but only 4 contiguous before the edge.
        assert_eq!(ring.free_size(), 12);
        assert_eq!(ring.available_size(), 4);
    }

    #[test]
    fn ring_wrapping_read() {
        let mut ring = RingBufferForSeqRead::new(8).unwrap();
        let r = ring.prepare(8);
        ring.fill(r, |b| {
            b.copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
            Ok(())
        })
        .unwrap();
        let mut first = [0u8; 6];
        ring.read(&mut first);
        let r2 = ring.prepare(4);
        assert_eq!(r2, 0..4); // wrapped to the left edge via available_size
        ring.fill(r2, |b| {
            b.copy_from_slice(&[8, 9, 10, 11]);
            Ok(())
        })
        .unwrap();
        let mut out = [0u8; 6];
        assert_eq!(ring.read(&mut out), 6);
        assert_eq!(out, [6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn reads_whole_device_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        let mut content = Vec::new();
        for i in 0..64u32 {
            content.extend(std::iter::repeat((i % 251) as u8).take(PBS));
        }
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&content)
            .unwrap();

        let mut reader = SeqBdevReader::open(&path, 0, 4 * PBS, 2 * PBS).unwrap();
        let mut out = vec![0u8; content.len()];
        // Uneven read sizes exercise wrapping and re-ahead.
        let mut off = 0;
        for chunk in [700usize, 1, 511, 8192, 4096].iter().cycle() {
            if off >= out.len() {
                break;
            }
            let n = (*chunk).min(out.len() - off);
            reader.read(&mut out[off..off + n]).unwrap();
            off += n;
        }
        assert_eq!(out, content);
        assert!(reader.read(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn respects_starting_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        let mut content = vec![0u8; PBS * 4];
        content[PBS] = 0xEE;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&content)
            .unwrap();
        let mut reader = SeqBdevReader::open(&path, 1, 4 * PBS, PBS).unwrap();
        let mut out = [0u8; 1];
        reader.read(&mut out).unwrap();
        assert_eq!(out[0], 0xEE);
    }
}
