//! Virtual full image scanner.
//!
//! A byte-oriented read interface over a base image overlaid by a merged
//! diff stream, without materializing the result. This is the read path for
//! apply, hash sync, restore, and archive replication.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use walbak_types::error::{Result, WalbakError};
use walbak_types::LOGICAL_BLOCK_SIZE;

use super::format::DiffRecKind;
use super::mem::RecIo;
use super::merge::DiffMerger;

/// The base image: seekable (a file or block device) or pipe-like. A
/// pipe-like base is advanced by reading and discarding so the cursor stays
/// synchronized with the diff stream.
pub enum BaseImage {
    Seekable(File),
    Stream(Box<dyn Read + Send>),
}

impl BaseImage {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let r = match self {
            BaseImage::Seekable(f) => f,
            BaseImage::Stream(r) => return read_fill(r.as_mut(), buf),
        };
        read_fill(r, buf)
    }

    fn skip_blocks(&mut self, blocks: u64) -> Result<()> {
        match self {
            BaseImage::Seekable(f) => {
                f.seek(SeekFrom::Current(blocks as i64 * LOGICAL_BLOCK_SIZE as i64))?;
                Ok(())
            }
            BaseImage::Stream(r) => {
                let mut sink = vec![0u8; LOGICAL_BLOCK_SIZE];
                for _ in 0..blocks {
                    // A short read here means the base ended under a diff
                    // record; the remaining blocks exist only in the diff.
                    let n = read_fill(r.as_mut(), &mut sink)?;
                    if n == 0 {
                        return Ok(());
                    }
                }
                Ok(())
            }
        }
    }
}

/// Read until `buf` is full or EOF; never errors on a clean EOF.
fn read_fill<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct VirtualFullScanner {
    base: BaseImage,
    records: VecDeque<RecIo>,
    /// Read cursor in logical blocks.
    addr: u64,
    cur: Option<RecIo>,
    /// Offset inside the current record, in logical blocks.
    off_in_io: u64,
}

impl VirtualFullScanner {
    /// `records` must be ascending and non-overlapping (a merger output).
    pub fn new(base: BaseImage, records: Vec<RecIo>) -> Self {
        VirtualFullScanner {
            base,
            records: records.into(),
            addr: 0,
            cur: None,
            off_in_io: 0,
        }
    }

    /// Build the scanner from a base image path and a diff chain.
    pub fn open(base_path: &Path, wdiff_paths: &[std::path::PathBuf]) -> Result<Self> {
        let base = BaseImage::Seekable(File::open(base_path)?);
        let records = if wdiff_paths.is_empty() {
            Vec::new()
        } else {
            let mut merger = DiffMerger::new();
            for p in wdiff_paths {
                merger.add_wdiff(p)?;
            }
            merger.into_records()
        };
        Ok(VirtualFullScanner::new(base, records))
    }

    fn fill_diff_io(&mut self) {
        let exhausted = match &self.cur {
            None => true,
            Some(rio) => self.off_in_io >= rio.rec.io_blocks as u64,
        };
        if exhausted {
            self.cur = self.records.pop_front();
            self.off_in_io = 0;
        }
    }

    /// Read up to `buf.len()` bytes; the length must be block aligned.
    /// Returns 0 at the end of the virtual image.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(WalbakError::BadRequest(format!(
                "scanner read of {} bytes is not block aligned",
                buf.len()
            )));
        }
        let want_blocks = ((buf.len() / LOGICAL_BLOCK_SIZE) as u64).min(u16::MAX as u64);
        if want_blocks == 0 {
            return Ok(0);
        }

        self.fill_diff_io();
        let Some(cur) = &self.cur else {
            // No remaining diff records: the rest of the base passes through.
            return self.read_base(buf, want_blocks);
        };

        let diff_addr = cur.start() + self.off_in_io;
        debug_assert!(self.addr <= diff_addr);
        if self.addr == diff_addr {
            let blocks = want_blocks.min(cur.rec.io_blocks as u64 - self.off_in_io);
            return self.read_wdiff(buf, blocks);
        }
        let blocks = want_blocks.min(diff_addr - self.addr);
        self.read_base(buf, blocks)
    }

    /// Fill `buf` exactly; errors if the virtual image ends first.
    pub fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.read_some(&mut buf[off..])?;
            if n == 0 {
                return Err(WalbakError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "virtual image ended early",
                )));
            }
            off += n;
        }
        Ok(())
    }

    /// Stream the whole virtual image into `w`. Returns bytes written.
    pub fn write_all_to<W: Write>(&mut self, w: &mut W, buf_size: usize) -> Result<u64> {
        let buf_size = buf_size - buf_size % LOGICAL_BLOCK_SIZE;
        let mut buf = vec![0u8; buf_size.max(LOGICAL_BLOCK_SIZE)];
        let mut total = 0u64;
        loop {
            let n = self.read_some(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            w.write_all(&buf[..n])?;
            total += n as u64;
        }
    }

    fn read_base(&mut self, buf: &mut [u8], blocks: u64) -> Result<usize> {
        let want = blocks as usize * LOGICAL_BLOCK_SIZE;
        let got = self.base.read_some(&mut buf[..want])?;
        if got % LOGICAL_BLOCK_SIZE != 0 {
            return Err(WalbakError::InvalidFormat(
                "base image is not a multiple of the logical block size".into(),
            ));
        }
        self.addr += (got / LOGICAL_BLOCK_SIZE) as u64;
        Ok(got)
    }

    fn read_wdiff(&mut self, buf: &mut [u8], blocks: u64) -> Result<usize> {
        let cur = self.cur.as_ref().expect("caller checked");
        let bytes = blocks as usize * LOGICAL_BLOCK_SIZE;
        match cur.rec.kind {
            DiffRecKind::Normal => {
                let off = self.off_in_io as usize * LOGICAL_BLOCK_SIZE;
                buf[..bytes].copy_from_slice(&cur.data[off..off + bytes]);
            }
            DiffRecKind::Discard | DiffRecKind::AllZero => {
                buf[..bytes].fill(0);
            }
        }
        self.off_in_io += blocks;
        // The base cursor skips what the diff covered.
        self.base.skip_blocks(blocks)?;
        self.addr += blocks;
        Ok(bytes)
    }
}
