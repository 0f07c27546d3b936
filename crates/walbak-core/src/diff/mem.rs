//! Address-ordered, non-overlapping record index used by the merger.
//!
//! Inserting a record trims or splits any earlier record it overlaps, so the
//! latest write for every block wins. DISCARD and ALL_ZERO records carry no
//! payload and short-circuit whatever they cover.

use std::collections::BTreeMap;

use walbak_types::LOGICAL_BLOCK_SIZE;

use super::format::{DiffRecKind, DiffRecord};

#[derive(Debug, Clone)]
pub struct RecIo {
    pub rec: DiffRecord,
    pub data: Vec<u8>,
}

impl RecIo {
    pub fn new(rec: DiffRecord, data: Vec<u8>) -> Self {
        debug_assert_eq!(rec.data_size as usize, data.len());
        RecIo { rec, data }
    }

    pub fn start(&self) -> u64 {
        self.rec.io_address
    }

    pub fn end(&self) -> u64 {
        self.rec.end_address()
    }

    /// A sub-range `[from, to)` of this record, in absolute block addresses.
    fn slice(&self, from: u64, to: u64) -> RecIo {
        debug_assert!(self.start() <= from && from < to && to <= self.end());
        let blocks = (to - from) as u16;
        match self.rec.kind {
            DiffRecKind::Normal => {
                let off = (from - self.start()) as usize * LOGICAL_BLOCK_SIZE;
                let len = blocks as usize * LOGICAL_BLOCK_SIZE;
                let data = self.data[off..off + len].to_vec();
                let rec = DiffRecord::normal(from, &data)
                    .expect("slice of a valid record is valid");
                RecIo { rec, data }
            }
            DiffRecKind::Discard => RecIo::new(DiffRecord::discard(from, blocks), Vec::new()),
            DiffRecKind::AllZero => RecIo::new(DiffRecord::all_zero(from, blocks), Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
pub struct DiffMemory {
    map: BTreeMap<u64, RecIo>,
}

impl DiffMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; it wins over anything already covering its range.
    pub fn insert(&mut self, rio: RecIo) {
        let na = rio.start();
        let nb = rio.end();

        // Collect the keys of every existing record overlapping [na, nb).
        let mut overlapping: Vec<u64> = Vec::new();
        if let Some((&k, e)) = self.map.range(..=na).next_back() {
            if e.end() > na {
                overlapping.push(k);
            }
        }
        for (&k, _) in self.map.range(na + 1..nb) {
            overlapping.push(k);
        }

        for k in overlapping {
            let old = self.map.remove(&k).expect("key collected above");
            if old.start() < na {
                let left = old.slice(old.start(), na);
                self.map.insert(left.start(), left);
            }
            if old.end() > nb {
                let right = old.slice(nb, old.end());
                self.map.insert(right.start(), right);
            }
        }
        self.map.insert(na, rio);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecIo> {
        self.map.values()
    }

    /// Records in ascending address order.
    pub fn into_records(self) -> Vec<RecIo> {
        self.map.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(addr: u64, blocks: u16, byte: u8) -> RecIo {
        let data = vec![byte; blocks as usize * LOGICAL_BLOCK_SIZE];
        RecIo::new(DiffRecord::normal(addr, &data).unwrap(), data)
    }

    fn spans(mem: &DiffMemory) -> Vec<(u64, u64, DiffRecKind)> {
        mem.iter()
            .map(|r| (r.start(), r.end(), r.rec.kind))
            .collect()
    }

    #[test]
    fn non_overlapping_records_coexist() {
        let mut mem = DiffMemory::new();
        mem.insert(normal(0, 4, 1));
        mem.insert(normal(8, 4, 2));
        assert_eq!(
            spans(&mem),
            vec![(0, 4, DiffRecKind::Normal), (8, 12, DiffRecKind::Normal)]
        );
    }

    #[test]
    fn later_record_wins_exact_overlap() {
        let mut mem = DiffMemory::new();
        mem.insert(normal(0, 4, 1));
        mem.insert(normal(0, 4, 2));
        assert_eq!(mem.len(), 1);
        let r = mem.iter().next().unwrap();
        assert_eq!(r.data[0], 2);
    }

    #[test]
    fn partial_overlap_splits_old_record() {
        let mut mem = DiffMemory::new();
        mem.insert(normal(0, 8, 1));
        mem.insert(normal(2, 4, 2));
        assert_eq!(
            spans(&mem),
            vec![
                (0, 2, DiffRecKind::Normal),
                (2, 6, DiffRecKind::Normal),
                (6, 8, DiffRecKind::Normal),
            ]
        );
        let parts: Vec<u8> = mem.iter().map(|r| r.data[0]).collect();
        assert_eq!(parts, vec![1, 2, 1]);
    }

    #[test]
    fn discard_short_circuits_earlier_writes() {
        let mut mem = DiffMemory::new();
        mem.insert(normal(0, 8, 1));
        mem.insert(RecIo::new(DiffRecord::discard(0, 8), Vec::new()));
        assert_eq!(spans(&mem), vec![(0, 8, DiffRecKind::Discard)]);
        assert!(mem.iter().next().unwrap().data.is_empty());
    }

    #[test]
    fn new_record_covers_several_old_ones() {
        let mut mem = DiffMemory::new();
        mem.insert(normal(0, 2, 1));
        mem.insert(normal(4, 2, 2));
        mem.insert(normal(8, 2, 3));
        mem.insert(RecIo::new(DiffRecord::all_zero(1, 8), Vec::new()));
        assert_eq!(
            spans(&mem),
            vec![
                (0, 1, DiffRecKind::Normal),
                (1, 9, DiffRecKind::AllZero),
                (9, 10, DiffRecKind::Normal),
            ]
        );
    }

    #[test]
    fn slice_preserves_payload_alignment() {
        let mut data = Vec::new();
        for i in 0..4u8 {
            data.extend(std::iter::repeat(i).take(LOGICAL_BLOCK_SIZE));
        }
        let mut mem = DiffMemory::new();
        mem.insert(RecIo::new(DiffRecord::normal(0, &data).unwrap(), data));
        mem.insert(normal(1, 2, 9));
        let records = mem.into_records();
        assert_eq!(records.len(), 3);
        // The right remnant starts at block 3 and kept block 3's bytes.
        assert_eq!(records[2].start(), 3);
        assert_eq!(records[2].data[0], 3);
    }
}
