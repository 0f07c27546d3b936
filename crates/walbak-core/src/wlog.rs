//! The wlog pack format: the write-ahead log stream a wlog-device exposes.
//!
//! A pack is one header block followed by the payload blocks of its NORMAL
//! records. The header checksum is salted with the volume's log salt and
//! covers the header minus the checksum field; each IO checksum covers its
//! payload under the same salt.

use std::io::Read;

use walbak_types::checksum::calc_checksum;
use walbak_types::error::{Result, WalbakError};
use walbak_types::LOGICAL_BLOCK_SIZE;

const SECTOR_TYPE_LOGPACK: u16 = 2;
const HEADER_PREFIX_SIZE: usize = 24;
const RECORD_SIZE: usize = 32;

/// Record count cap keeps one header block bounded.
pub const MAX_WLOG_PACK_RECORDS: usize = 64;

const FLAG_NORMAL: u16 = 0;
const FLAG_DISCARD: u16 = 1;
const FLAG_PADDING: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WlogRecKind {
    Normal,
    Discard,
    /// Filler emitted when a pack wraps the ring; carries no device write.
    Padding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlogRecord {
    pub lsid: u64,
    /// Write destination on the data device, in logical blocks.
    pub offset_lb: u64,
    pub io_size_lb: u16,
    pub kind: WlogRecKind,
    pub checksum: u32,
}

impl WlogRecord {
    pub fn has_data(&self) -> bool {
        self.kind == WlogRecKind::Normal
    }

    pub fn data_size(&self) -> usize {
        if self.has_data() {
            self.io_size_lb as usize * LOGICAL_BLOCK_SIZE
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WlogPackHeader {
    pub logpack_lsid: u64,
    pub records: Vec<WlogRecord>,
}

impl WlogPackHeader {
    pub fn new(logpack_lsid: u64) -> Self {
        WlogPackHeader {
            logpack_lsid,
            records: Vec::new(),
        }
    }

    pub fn total_io_size_lb(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.has_data())
            .map(|r| r.io_size_lb as u64)
            .sum()
    }

    pub fn encoded_size(&self) -> usize {
        HEADER_PREFIX_SIZE + self.records.len() * RECORD_SIZE
    }

    pub fn encode(&self, salt: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size()];
        buf[4..6].copy_from_slice(&SECTOR_TYPE_LOGPACK.to_le_bytes());
        buf[6..8].copy_from_slice(&(self.total_io_size_lb() as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.logpack_lsid.to_le_bytes());
        buf[16..18].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = HEADER_PREFIX_SIZE + i * RECORD_SIZE;
            let slot = &mut buf[off..off + RECORD_SIZE];
            slot[0..4].copy_from_slice(&rec.checksum.to_le_bytes());
            let flags = match rec.kind {
                WlogRecKind::Normal => FLAG_NORMAL,
                WlogRecKind::Discard => FLAG_DISCARD,
                WlogRecKind::Padding => FLAG_PADDING,
            };
            slot[4..6].copy_from_slice(&flags.to_le_bytes());
            slot[6..8].copy_from_slice(&rec.io_size_lb.to_le_bytes());
            slot[8..16].copy_from_slice(&rec.offset_lb.to_le_bytes());
            slot[16..24].copy_from_slice(&rec.lsid.to_le_bytes());
        }
        let csum = calc_checksum(&buf[4..], salt);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8], salt: u32) -> Result<Self> {
        if buf.len() < HEADER_PREFIX_SIZE {
            return Err(WalbakError::InvalidFormat("short wlog pack header".into()));
        }
        let stored = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if calc_checksum(&buf[4..], salt) != stored {
            return Err(WalbakError::InvalidFormat(
                "wlog pack header checksum mismatch".into(),
            ));
        }
        let sector_type = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if sector_type != SECTOR_TYPE_LOGPACK {
            return Err(WalbakError::InvalidFormat(format!(
                "bad wlog sector type {sector_type}"
            )));
        }
        let logpack_lsid = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let n_records = u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize;
        if buf.len() != HEADER_PREFIX_SIZE + n_records * RECORD_SIZE {
            return Err(WalbakError::InvalidFormat(
                "wlog pack header size mismatch".into(),
            ));
        }
        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let off = HEADER_PREFIX_SIZE + i * RECORD_SIZE;
            let slot = &buf[off..off + RECORD_SIZE];
            let checksum = u32::from_le_bytes(slot[0..4].try_into().unwrap());
            let flags = u16::from_le_bytes(slot[4..6].try_into().unwrap());
            let io_size_lb = u16::from_le_bytes(slot[6..8].try_into().unwrap());
            let offset_lb = u64::from_le_bytes(slot[8..16].try_into().unwrap());
            let lsid = u64::from_le_bytes(slot[16..24].try_into().unwrap());
            let kind = match flags {
                FLAG_NORMAL => WlogRecKind::Normal,
                FLAG_DISCARD => WlogRecKind::Discard,
                FLAG_PADDING => WlogRecKind::Padding,
                other => {
                    return Err(WalbakError::InvalidFormat(format!(
                        "unknown wlog record flags {other}"
                    )))
                }
            };
            records.push(WlogRecord {
                lsid,
                offset_lb,
                io_size_lb,
                kind,
                checksum,
            });
        }
        Ok(WlogPackHeader {
            logpack_lsid,
            records,
        })
    }
}

pub fn verify_wlog_io(rec: &WlogRecord, data: &[u8], salt: u32) -> Result<()> {
    if data.len() != rec.data_size() {
        return Err(WalbakError::InvalidFormat(format!(
            "wlog IO at lsid {} carries {} bytes, expected {}",
            rec.lsid,
            data.len(),
            rec.data_size()
        )));
    }
    if rec.has_data() {
        let csum = calc_checksum(data, salt);
        if csum != rec.checksum {
            return Err(WalbakError::InvalidFormat(format!(
                "wlog IO checksum mismatch at lsid {}",
                rec.lsid
            )));
        }
    }
    Ok(())
}

/// One pack with its payloads, as read from the device log stream.
#[derive(Debug, Clone)]
pub struct WlogPack {
    pub header: WlogPackHeader,
    /// One payload per record; empty for DISCARD and PADDING.
    pub ios: Vec<Vec<u8>>,
}

impl WlogPack {
    /// End lsid of this pack: the next pack starts here.
    pub fn end_lsid(&self) -> u64 {
        self.header
            .records
            .iter()
            .map(|r| r.lsid + r.io_size_lb as u64)
            .max()
            .unwrap_or(self.header.logpack_lsid)
    }
}

/// Helper for building packs (used by tests and the device simulator).
pub struct WlogPackBuilder {
    salt: u32,
    header: WlogPackHeader,
    ios: Vec<Vec<u8>>,
    next_lsid: u64,
}

impl WlogPackBuilder {
    pub fn new(logpack_lsid: u64, salt: u32) -> Self {
        WlogPackBuilder {
            salt,
            header: WlogPackHeader::new(logpack_lsid),
            ios: Vec::new(),
            next_lsid: logpack_lsid,
        }
    }

    pub fn add_write(&mut self, offset_lb: u64, data: Vec<u8>) -> Result<&mut Self> {
        if data.is_empty() || data.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(WalbakError::BadRequest(
                "wlog write must be a positive multiple of the block size".into(),
            ));
        }
        let io_size_lb = (data.len() / LOGICAL_BLOCK_SIZE) as u16;
        self.header.records.push(WlogRecord {
            lsid: self.next_lsid,
            offset_lb,
            io_size_lb,
            kind: WlogRecKind::Normal,
            checksum: calc_checksum(&data, self.salt),
        });
        self.next_lsid += io_size_lb as u64;
        self.ios.push(data);
        Ok(self)
    }

    pub fn add_discard(&mut self, offset_lb: u64, io_size_lb: u16) -> &mut Self {
        self.header.records.push(WlogRecord {
            lsid: self.next_lsid,
            offset_lb,
            io_size_lb,
            kind: WlogRecKind::Discard,
            checksum: 0,
        });
        self.next_lsid += io_size_lb as u64;
        self.ios.push(Vec::new());
        self
    }

    pub fn build(self) -> WlogPack {
        WlogPack {
            header: self.header,
            ios: self.ios,
        }
    }
}

/// Sequential reader over a device log stream: a concatenation of encoded
/// packs, each prefixed by its encoded byte length.
pub struct WlogStreamReader<R: Read> {
    r: R,
    salt: u32,
}

impl<R: Read> WlogStreamReader<R> {
    pub fn new(r: R, salt: u32) -> Self {
        WlogStreamReader { r, salt }
    }

    /// Next pack, or `None` at end of stream.
    pub fn read_pack(&mut self) -> Result<Option<WlogPack>> {
        let mut len_buf = [0u8; 4];
        match self.r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len < HEADER_PREFIX_SIZE || len > HEADER_PREFIX_SIZE + MAX_WLOG_PACK_RECORDS * RECORD_SIZE
        {
            return Err(WalbakError::InvalidFormat(format!(
                "implausible wlog pack header length {len}"
            )));
        }
        let mut head = vec![0u8; len];
        self.r.read_exact(&mut head)?;
        let header = WlogPackHeader::decode(&head, self.salt)?;
        let mut ios = Vec::with_capacity(header.records.len());
        for rec in &header.records {
            let mut data = vec![0u8; rec.data_size()];
            self.r.read_exact(&mut data)?;
            verify_wlog_io(rec, &data, self.salt)?;
            ios.push(data);
        }
        Ok(Some(WlogPack { header, ios }))
    }
}

/// Append packs to a device log stream, mirroring [`WlogStreamReader`].
pub fn write_pack<W: std::io::Write>(w: &mut W, pack: &WlogPack, salt: u32) -> Result<()> {
    let head = pack.header.encode(salt);
    w.write_all(&(head.len() as u32).to_le_bytes())?;
    w.write_all(&head)?;
    for data in &pack.ios {
        w.write_all(data)?;
    }
    Ok(())
}
