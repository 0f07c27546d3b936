//! Compaction of a contiguous diff chain into one equivalent diff.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use walbak_types::error::{Result, WalbakError};
use walbak_types::uuid::Uuid;

use crate::meta::MetaDiff;

use super::format::{DiffFileHeader, DiffReader, DiffWriter};
use super::mem::{DiffMemory, RecIo};

/// Accumulates diff files in chain order; for each block the latest record
/// wins. The merged output's snap is `(first.snap_b, last.snap_e)`.
pub struct DiffMerger {
    mem: DiffMemory,
    first: Option<MetaDiff>,
    last: Option<MetaDiff>,
    uuid: Option<Uuid>,
    max_io_blocks: u16,
}

impl DiffMerger {
    pub fn new() -> Self {
        DiffMerger {
            mem: DiffMemory::new(),
            first: None,
            last: None,
            uuid: None,
            max_io_blocks: 0,
        }
    }

    /// Add the next diff in the chain. The file's begin snap must equal the
    /// previous file's end snap.
    pub fn add_wdiff(&mut self, path: &Path) -> Result<()> {
        let size_b = std::fs::metadata(path)?.len();
        let file = BufReader::new(File::open(path)?);
        let mut reader = DiffReader::new(file, size_b)?;
        let header = *reader.header();

        if let Some(last) = &self.last {
            if header.diff.snap_b != last.snap_e {
                return Err(WalbakError::InvalidFormat(format!(
                    "diff chain broken at {}: {} does not continue {}",
                    path.display(),
                    header.diff,
                    last
                )));
            }
        } else {
            self.first = Some(header.diff);
        }
        self.last = Some(header.diff);
        self.uuid = Some(header.uuid);
        self.max_io_blocks = self.max_io_blocks.max(header.max_io_blocks);

        while let Some((rec, data)) = reader.read_record()? {
            self.mem.insert(RecIo::new(rec, data));
        }
        Ok(())
    }

    pub fn merged_diff(&self) -> Result<MetaDiff> {
        let first = self
            .first
            .ok_or_else(|| WalbakError::Other("merger has no inputs".into()))?;
        let last = self.last.expect("first implies last");
        MetaDiff::new(first.snap_b, last.snap_e, last.timestamp_s, 0)
    }

    /// Compacted records in ascending address order, for the scanner.
    pub fn into_records(self) -> Vec<RecIo> {
        self.mem.into_records()
    }

    /// Write the compacted diff. Returns its descriptor (size filled in by
    /// the caller from the resulting file).
    pub fn write_to<W: Write>(self, w: W) -> Result<MetaDiff> {
        let diff = self.merged_diff()?;
        let uuid = self.uuid.expect("inputs carry a uuid");
        let mut max_io_blocks = self.max_io_blocks;
        for r in self.mem.iter() {
            max_io_blocks = max_io_blocks.max(r.rec.io_blocks);
        }
        let mut writer = DiffWriter::new(w);
        writer.write_header(&DiffFileHeader {
            uuid,
            max_io_blocks,
            diff,
        })?;
        for rio in self.mem.into_records() {
            writer.add_record(rio.rec, rio.data)?;
        }
        writer.finish()?;
        Ok(diff)
    }
}

impl Default for DiffMerger {
    fn default() -> Self {
        Self::new()
    }
}
