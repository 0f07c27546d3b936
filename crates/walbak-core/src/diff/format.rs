//! The wdiff on-disk format.
//!
//! Layout: a fixed 96-byte header, then packs. Each pack is a fixed-size pack
//! header (a record count plus 32 record slots) followed by the records'
//! payload blocks in order. A pack with zero records terminates the file.
//! The header carries the diff's snap bounds so a directory scan can rebuild
//! the catalog without a sidecar index.

use std::io::{Read, Write};

use walbak_types::checksum::calc_checksum;
use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::Snap;
use walbak_types::uuid::Uuid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::meta::MetaDiff;

pub const DIFF_MAGIC: &[u8; 8] = b"WLBKDIF\0";
pub const DIFF_VERSION: u16 = 1;
pub const DIFF_HEADER_SIZE: usize = 96;

/// Records per pack. A shorter final pack is padded with empty slots.
pub const MAX_PACK_RECORDS: usize = 32;
const RECORD_SLOT_SIZE: usize = 24;
const PACK_HEADER_SIZE: usize = 8 + MAX_PACK_RECORDS * RECORD_SLOT_SIZE;

const FLAG_NORMAL: u16 = 0;
const FLAG_DISCARD: u16 = 1;
const FLAG_ALL_ZERO: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffRecKind {
    /// Payload blocks follow in the pack body.
    Normal,
    /// The range was discarded; reads as zeros, no payload.
    Discard,
    /// The range is known zero; no payload.
    AllZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRecord {
    pub io_address: u64,
    pub io_blocks: u16,
    pub kind: DiffRecKind,
    pub data_size: u32,
    pub checksum: u32,
}

impl DiffRecord {
    pub fn normal(io_address: u64, data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(WalbakError::InvalidFormat(format!(
                "diff payload of {} bytes is not block aligned",
                data.len()
            )));
        }
        let blocks = data.len() / LOGICAL_BLOCK_SIZE;
        if blocks > u16::MAX as usize {
            return Err(WalbakError::InvalidFormat(format!(
                "diff record of {blocks} blocks exceeds the record limit"
            )));
        }
        Ok(DiffRecord {
            io_address,
            io_blocks: blocks as u16,
            kind: DiffRecKind::Normal,
            data_size: data.len() as u32,
            checksum: calc_checksum(data, 0),
        })
    }

    pub fn discard(io_address: u64, io_blocks: u16) -> Self {
        DiffRecord {
            io_address,
            io_blocks,
            kind: DiffRecKind::Discard,
            data_size: 0,
            checksum: 0,
        }
    }

    pub fn all_zero(io_address: u64, io_blocks: u16) -> Self {
        DiffRecord {
            io_address,
            io_blocks,
            kind: DiffRecKind::AllZero,
            data_size: 0,
            checksum: 0,
        }
    }

    pub fn end_address(&self) -> u64 {
        self.io_address + self.io_blocks as u64
    }

    pub fn verify_data(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.data_size as usize {
            return Err(WalbakError::InvalidFormat(format!(
                "record at {} carries {} bytes, header says {}",
                self.io_address,
                data.len(),
                self.data_size
            )));
        }
        if self.kind == DiffRecKind::Normal {
            if self.data_size as usize != self.io_blocks as usize * LOGICAL_BLOCK_SIZE {
                return Err(WalbakError::InvalidFormat(format!(
                    "record at {} data size mismatches block count",
                    self.io_address
                )));
            }
            let csum = calc_checksum(data, 0);
            if csum != self.checksum {
                return Err(WalbakError::InvalidFormat(format!(
                    "record at {} checksum mismatch: {:08x} != {:08x}",
                    self.io_address, csum, self.checksum
                )));
            }
        } else if self.data_size != 0 {
            return Err(WalbakError::InvalidFormat(format!(
                "non-normal record at {} carries payload",
                self.io_address
            )));
        }
        Ok(())
    }

    fn encode_into(&self, slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), RECORD_SLOT_SIZE);
        slot[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        slot[8..10].copy_from_slice(&self.io_blocks.to_le_bytes());
        let flags = match self.kind {
            DiffRecKind::Normal => FLAG_NORMAL,
            DiffRecKind::Discard => FLAG_DISCARD,
            DiffRecKind::AllZero => FLAG_ALL_ZERO,
        };
        slot[10..12].copy_from_slice(&flags.to_le_bytes());
        slot[12..16].copy_from_slice(&self.data_size.to_le_bytes());
        slot[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        slot[20..24].fill(0);
    }

    fn decode_from(slot: &[u8]) -> Result<Self> {
        debug_assert_eq!(slot.len(), RECORD_SLOT_SIZE);
        let io_address = u64::from_le_bytes(slot[0..8].try_into().unwrap());
        let io_blocks = u16::from_le_bytes(slot[8..10].try_into().unwrap());
        let flags = u16::from_le_bytes(slot[10..12].try_into().unwrap());
        let data_size = u32::from_le_bytes(slot[12..16].try_into().unwrap());
        let checksum = u32::from_le_bytes(slot[16..20].try_into().unwrap());
        let kind = match flags {
            FLAG_NORMAL => DiffRecKind::Normal,
            FLAG_DISCARD => DiffRecKind::Discard,
            FLAG_ALL_ZERO => DiffRecKind::AllZero,
            other => {
                return Err(WalbakError::InvalidFormat(format!(
                    "unknown diff record flags {other}"
                )))
            }
        };
        if io_blocks == 0 {
            return Err(WalbakError::InvalidFormat("zero-length diff record".into()));
        }
        Ok(DiffRecord {
            io_address,
            io_blocks,
            kind,
            data_size,
            checksum,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffFileHeader {
    pub uuid: Uuid,
    pub max_io_blocks: u16,
    pub diff: MetaDiff,
}

impl DiffFileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIFF_HEADER_SIZE];
        buf[0..8].copy_from_slice(DIFF_MAGIC);
        buf[8..10].copy_from_slice(&DIFF_VERSION.to_le_bytes());
        buf[10..12].copy_from_slice(&self.max_io_blocks.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        buf[28..36].copy_from_slice(&self.diff.snap_b.gid0.to_le_bytes());
        buf[36..44].copy_from_slice(&self.diff.snap_b.gid1.to_le_bytes());
        buf[44..52].copy_from_slice(&self.diff.snap_e.gid0.to_le_bytes());
        buf[52..60].copy_from_slice(&self.diff.snap_e.gid1.to_le_bytes());
        buf[60..68].copy_from_slice(&self.diff.timestamp_s.to_le_bytes());
        // [68..92) reserved, zero.
        let csum = calc_checksum(&buf[0..92], 0);
        buf[92..96].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8], size_b: u64) -> Result<Self> {
        if buf.len() != DIFF_HEADER_SIZE {
            return Err(WalbakError::InvalidFormat("short wdiff header".into()));
        }
        if &buf[0..8] != DIFF_MAGIC {
            return Err(WalbakError::InvalidFormat("bad wdiff magic".into()));
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if version != DIFF_VERSION {
            return Err(WalbakError::InvalidFormat(format!(
                "unsupported wdiff version {version}"
            )));
        }
        let stored = u32::from_le_bytes(buf[92..96].try_into().unwrap());
        let csum = calc_checksum(&buf[0..92], 0);
        if stored != csum {
            return Err(WalbakError::InvalidFormat("wdiff header checksum mismatch".into()));
        }
        let max_io_blocks = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let uuid = Uuid::from_bytes(buf[12..28].try_into().unwrap());
        let b0 = u64::from_le_bytes(buf[28..36].try_into().unwrap());
        let b1 = u64::from_le_bytes(buf[36..44].try_into().unwrap());
        let e0 = u64::from_le_bytes(buf[44..52].try_into().unwrap());
        let e1 = u64::from_le_bytes(buf[52..60].try_into().unwrap());
        let timestamp_s = u64::from_le_bytes(buf[60..68].try_into().unwrap());
        let diff = MetaDiff::new(Snap::new(b0, b1)?, Snap::new(e0, e1)?, timestamp_s, size_b)?;
        Ok(DiffFileHeader {
            uuid,
            max_io_blocks,
            diff,
        })
    }
}

/// Streaming wdiff writer. Records buffer into packs of up to
/// [`MAX_PACK_RECORDS`]; `finish` writes the trailer pack.
pub struct DiffWriter<W: Write> {
    w: W,
    pending: Vec<(DiffRecord, Vec<u8>)>,
    wrote_header: bool,
}

impl<W: Write> DiffWriter<W> {
    pub fn new(w: W) -> Self {
        DiffWriter {
            w,
            pending: Vec::with_capacity(MAX_PACK_RECORDS),
            wrote_header: false,
        }
    }

    pub fn write_header(&mut self, header: &DiffFileHeader) -> Result<()> {
        if self.wrote_header {
            return Err(WalbakError::Other("wdiff header written twice".into()));
        }
        self.w.write_all(&header.encode())?;
        self.wrote_header = true;
        Ok(())
    }

    pub fn add_record(&mut self, rec: DiffRecord, data: Vec<u8>) -> Result<()> {
        if !self.wrote_header {
            return Err(WalbakError::Other("wdiff record before header".into()));
        }
        rec.verify_data(&data)?;
        self.pending.push((rec, data));
        if self.pending.len() == MAX_PACK_RECORDS {
            self.flush_pack()?;
        }
        Ok(())
    }

    fn flush_pack(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pack = encode_pack(&self.pending)?;
        self.w.write_all(&pack)?;
        self.pending.clear();
        Ok(())
    }

    /// Flush the last pack and the trailer, returning the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.flush_pack()?;
        let mut trailer = vec![0u8; PACK_HEADER_SIZE];
        trailer[0..4].copy_from_slice(&0u32.to_le_bytes());
        self.w.write_all(&trailer)?;
        self.w.flush()?;
        Ok(self.w)
    }
}

/// Encode one pack: header with up to [`MAX_PACK_RECORDS`] slots followed by
/// the payloads in record order. Also the unit of the wdiff wire transfer.
pub fn encode_pack(items: &[(DiffRecord, Vec<u8>)]) -> Result<Vec<u8>> {
    if items.is_empty() || items.len() > MAX_PACK_RECORDS {
        return Err(WalbakError::InvalidFormat(format!(
            "pack of {} records",
            items.len()
        )));
    }
    let total: u32 = items.iter().map(|(r, _)| r.data_size).sum();
    let mut buf = vec![0u8; PACK_HEADER_SIZE + total as usize];
    buf[0..4].copy_from_slice(&(items.len() as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&total.to_le_bytes());
    let mut data_off = PACK_HEADER_SIZE;
    for (i, (rec, data)) in items.iter().enumerate() {
        let off = 8 + i * RECORD_SLOT_SIZE;
        rec.encode_into(&mut buf[off..off + RECORD_SLOT_SIZE]);
        buf[data_off..data_off + data.len()].copy_from_slice(data);
        data_off += data.len();
    }
    Ok(buf)
}

/// Decode one pack produced by [`encode_pack`], validating payloads.
/// Returns an empty vector for a trailer pack.
pub fn decode_pack(buf: &[u8]) -> Result<Vec<(DiffRecord, Vec<u8>)>> {
    if buf.len() < PACK_HEADER_SIZE {
        return Err(WalbakError::InvalidFormat("short diff pack".into()));
    }
    let n = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if n == 0 {
        return Ok(Vec::new());
    }
    if n > MAX_PACK_RECORDS {
        return Err(WalbakError::InvalidFormat(format!("pack claims {n} records")));
    }
    let total = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    if buf.len() != PACK_HEADER_SIZE + total {
        return Err(WalbakError::InvalidFormat(
            "diff pack payload size mismatch".into(),
        ));
    }
    let mut items = Vec::with_capacity(n);
    let mut data_off = PACK_HEADER_SIZE;
    for i in 0..n {
        let off = 8 + i * RECORD_SLOT_SIZE;
        let rec = DiffRecord::decode_from(&buf[off..off + RECORD_SLOT_SIZE])?;
        let end = data_off + rec.data_size as usize;
        if end > buf.len() {
            return Err(WalbakError::InvalidFormat("diff pack truncated".into()));
        }
        let data = buf[data_off..end].to_vec();
        rec.verify_data(&data)?;
        data_off = end;
        items.push((rec, data));
    }
    Ok(items)
}

/// Streaming wdiff reader; validates record checksums as it goes.
pub struct DiffReader<R: Read> {
    r: R,
    header: DiffFileHeader,
    pending: std::collections::VecDeque<(DiffRecord, Vec<u8>)>,
    at_end: bool,
}

impl<R: Read> DiffReader<R> {
    /// `size_b` is the file size recorded into the decoded `MetaDiff`.
    pub fn new(mut r: R, size_b: u64) -> Result<Self> {
        let mut buf = vec![0u8; DIFF_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        let header = DiffFileHeader::decode(&buf, size_b)?;
        Ok(DiffReader {
            r,
            header,
            pending: std::collections::VecDeque::new(),
            at_end: false,
        })
    }

    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    pub fn read_record(&mut self) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        if let Some(item) = self.pending.pop_front() {
            return Ok(Some(item));
        }
        if self.at_end {
            return Ok(None);
        }
        let mut head = vec![0u8; PACK_HEADER_SIZE];
        self.r.read_exact(&mut head)?;
        let n = u32::from_le_bytes(head[0..4].try_into().unwrap()) as usize;
        if n == 0 {
            self.at_end = true;
            return Ok(None);
        }
        if n > MAX_PACK_RECORDS {
            return Err(WalbakError::InvalidFormat(format!(
                "pack claims {n} records"
            )));
        }
        let mut recs = Vec::with_capacity(n);
        for i in 0..n {
            let off = 8 + i * RECORD_SLOT_SIZE;
            recs.push(DiffRecord::decode_from(&head[off..off + RECORD_SLOT_SIZE])?);
        }
        for rec in recs {
            let mut data = vec![0u8; rec.data_size as usize];
            self.r.read_exact(&mut data)?;
            rec.verify_data(&data)?;
            self.pending.push_back((rec, data));
        }
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> DiffFileHeader {
        DiffFileHeader {
            uuid: Uuid::from_bytes([7; 16]),
            max_io_blocks: 64,
            diff: MetaDiff::new(Snap::clean(0), Snap::clean(2), 1234, 0).unwrap(),
        }
    }

    #[test]
    fn header_roundtrip() {
        let h = header();
        let decoded = DiffFileHeader::decode(&h.encode(), 99).unwrap();
        assert_eq!(decoded.uuid, h.uuid);
        assert_eq!(decoded.max_io_blocks, 64);
        assert_eq!(decoded.diff.snap_b, Snap::clean(0));
        assert_eq!(decoded.diff.snap_e, Snap::clean(2));
        assert_eq!(decoded.diff.size_b, 99);
    }

    #[test]
    fn header_rejects_corruption() {
        let mut buf = header().encode();
        buf[30] ^= 0xff;
        assert!(DiffFileHeader::decode(&buf, 0).is_err());
    }

    #[test]
    fn write_then_read_records() {
        let mut w = DiffWriter::new(Vec::new());
        w.write_header(&header()).unwrap();
        let d1 = vec![0xAA; LOGICAL_BLOCK_SIZE];
        w.add_record(DiffRecord::normal(10, &d1).unwrap(), d1.clone())
            .unwrap();
        w.add_record(DiffRecord::discard(20, 4), Vec::new()).unwrap();
        w.add_record(DiffRecord::all_zero(30, 2), Vec::new()).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = DiffReader::new(&bytes[..], bytes.len() as u64).unwrap();
        let (r1, data1) = r.read_record().unwrap().unwrap();
        assert_eq!(r1.kind, DiffRecKind::Normal);
        assert_eq!(r1.io_address, 10);
        assert_eq!(data1, d1);
        let (r2, _) = r.read_record().unwrap().unwrap();
        assert_eq!(r2.kind, DiffRecKind::Discard);
        assert_eq!(r2.io_blocks, 4);
        let (r3, _) = r.read_record().unwrap().unwrap();
        assert_eq!(r3.kind, DiffRecKind::AllZero);
        assert!(r.read_record().unwrap().is_none());
        // Reads past the trailer stay at end.
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn many_records_span_packs() {
        let mut w = DiffWriter::new(Vec::new());
        w.write_header(&header()).unwrap();
        for i in 0..100u64 {
            let data = vec![i as u8; LOGICAL_BLOCK_SIZE];
            w.add_record(DiffRecord::normal(i * 8, &data).unwrap(), data)
                .unwrap();
        }
        let bytes = w.finish().unwrap();
        let mut r = DiffReader::new(&bytes[..], 0).unwrap();
        let mut count = 0u64;
        while let Some((rec, data)) = r.read_record().unwrap() {
            assert_eq!(rec.io_address, count * 8);
            assert_eq!(data[0], count as u8);
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let mut w = DiffWriter::new(Vec::new());
        w.write_header(&header()).unwrap();
        let data = vec![0x55; LOGICAL_BLOCK_SIZE];
        w.add_record(DiffRecord::normal(0, &data).unwrap(), data)
            .unwrap();
        let mut bytes = w.finish().unwrap();
        // Flip a payload byte after the header + pack header.
        let payload_off = DIFF_HEADER_SIZE + PACK_HEADER_SIZE;
        bytes[payload_off] ^= 0x01;
        let mut r = DiffReader::new(&bytes[..], 0).unwrap();
        assert!(r.read_record().is_err());
    }
}
