//! Compression engines and the in-flight compressed chunk.
//!
//! The codec set is sealed: identity, snappy, zlib, xz. Codecs share the
//! `max_out_size` / `compress` / `uncompress` vocabulary so the pipeline does
//! not care which one a transfer negotiated.

use std::io::Read;

use serde::{Deserialize, Serialize};

use walbak_proto::packet::Packet;
use walbak_types::error::{Result, WalbakError};

use crate::queue::BoundedQueue;

/// Cap on a single decompressed chunk. A frame carries at most 65,535
/// logical blocks, so anything past this is a corrupt or hostile stream.
pub const MAX_CHUNK_SIZE: usize = 64 << 20;

const TAG_AS_IS: u8 = 0;
const TAG_SNAPPY: u8 = 1;
const TAG_ZLIB: u8 = 2;
const TAG_XZ: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Codec {
    AsIs,
    #[default]
    Snappy,
    Zlib,
    Xz,
}

impl Codec {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Codec::AsIs),
            "snappy" => Ok(Codec::Snappy),
            "zlib" => Ok(Codec::Zlib),
            "xz" => Ok(Codec::Xz),
            other => Err(WalbakError::BadRequest(format!(
                "unknown compression codec: {other}"
            ))),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Codec::AsIs => TAG_AS_IS,
            Codec::Snappy => TAG_SNAPPY,
            Codec::Zlib => TAG_ZLIB,
            Codec::Xz => TAG_XZ,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_AS_IS => Ok(Codec::AsIs),
            TAG_SNAPPY => Ok(Codec::Snappy),
            TAG_ZLIB => Ok(Codec::Zlib),
            TAG_XZ => Ok(Codec::Xz),
            other => Err(WalbakError::Compression(format!("unknown codec tag {other}"))),
        }
    }

    /// Worst-case output size for `in_size` input bytes.
    pub fn max_out_size(self, in_size: usize) -> usize {
        match self {
            Codec::AsIs => in_size,
            Codec::Snappy => snap::raw::max_compress_len(in_size),
            // zlib bound: input + 0.1% + a small constant.
            Codec::Zlib => in_size + in_size / 1000 + 64,
            // xz stream overhead is larger but still linear.
            Codec::Xz => in_size + in_size / 3 + 128,
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::AsIs => Ok(data.to_vec()),
            Codec::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| WalbakError::Compression(format!("snappy: {e}"))),
            Codec::Zlib => {
                let mut out = Vec::with_capacity(data.len() / 2 + 16);
                let mut enc =
                    flate2::read::ZlibEncoder::new(data, flate2::Compression::default());
                enc.read_to_end(&mut out)
                    .map_err(|e| WalbakError::Compression(format!("zlib: {e}")))?;
                Ok(out)
            }
            Codec::Xz => {
                let mut out = Vec::with_capacity(data.len() / 2 + 64);
                let mut enc = xz2::read::XzEncoder::new(data, 6);
                enc.read_to_end(&mut out)
                    .map_err(|e| WalbakError::Compression(format!("xz: {e}")))?;
                Ok(out)
            }
        }
    }

    /// Decompress and verify the decoded length against `orig_size`.
    pub fn uncompress(self, data: &[u8], orig_size: usize) -> Result<Vec<u8>> {
        if orig_size > MAX_CHUNK_SIZE {
            return Err(WalbakError::Compression(format!(
                "declared size {orig_size} exceeds chunk limit"
            )));
        }
        let out = match self {
            Codec::AsIs => data.to_vec(),
            Codec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| WalbakError::Compression(format!("snappy: {e}")))?,
            Codec::Zlib => {
                let mut out = Vec::with_capacity(orig_size);
                let mut dec = flate2::read::ZlibDecoder::new(data);
                dec.by_ref()
                    .take(MAX_CHUNK_SIZE as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| WalbakError::Compression(format!("zlib: {e}")))?;
                out
            }
            Codec::Xz => {
                let mut out = Vec::with_capacity(orig_size);
                let mut dec = xz2::read::XzDecoder::new(data);
                dec.by_ref()
                    .take(MAX_CHUNK_SIZE as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| WalbakError::Compression(format!("xz: {e}")))?;
                out
            }
        };
        if out.len() != orig_size {
            return Err(WalbakError::Compression(format!(
                "decoded size {} differs from declared {orig_size}",
                out.len()
            )));
        }
        Ok(out)
    }
}

/// One unit of data in flight across a pipeline. Either still plain
/// (`codec == AsIs`) or encoded by one of the engines.
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    orig_size: u32,
    codec: Codec,
    data: Vec<u8>,
}

impl CompressedChunk {
    /// Wrap plain bytes without encoding.
    pub fn plain(data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_CHUNK_SIZE {
            return Err(WalbakError::Compression(format!(
                "chunk of {} bytes exceeds limit",
                data.len()
            )));
        }
        Ok(CompressedChunk {
            orig_size: data.len() as u32,
            codec: Codec::AsIs,
            data,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.codec != Codec::AsIs
    }

    pub fn orig_size(&self) -> usize {
        self.orig_size as usize
    }

    /// Encode with `codec`. Keeps the plain bytes when encoding does not
    /// actually shrink them.
    pub fn compress(self, codec: Codec) -> Result<Self> {
        if self.is_compressed() || codec == Codec::AsIs {
            return Ok(self);
        }
        let encoded = codec.compress(&self.data)?;
        if encoded.len() >= self.data.len() {
            return Ok(self);
        }
        Ok(CompressedChunk {
            orig_size: self.orig_size,
            codec,
            data: encoded,
        })
    }

    /// Back to plain bytes.
    pub fn uncompress(self) -> Result<Self> {
        if !self.is_compressed() {
            return Ok(self);
        }
        let plain = self.codec.uncompress(&self.data, self.orig_size as usize)?;
        Ok(CompressedChunk {
            orig_size: self.orig_size,
            codec: Codec::AsIs,
            data: plain,
        })
    }

    /// The payload. Call `uncompress` first if plain bytes are required.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Wire form: orig_size, codec tag, payload length, payload.
    pub fn send<S: std::io::Read + std::io::Write>(&self, pkt: &mut Packet<S>) -> Result<()> {
        let mut head = [0u8; 9];
        head[0..4].copy_from_slice(&self.orig_size.to_le_bytes());
        head[4] = self.codec.tag();
        head[5..9].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        pkt.write_raw(&head)?;
        pkt.write_raw(&self.data)?;
        Ok(())
    }

    pub fn recv<S: std::io::Read + std::io::Write>(pkt: &mut Packet<S>) -> Result<Self> {
        let mut head = [0u8; 9];
        pkt.read_raw(&mut head)?;
        let orig_size = u32::from_le_bytes(head[0..4].try_into().unwrap());
        let codec = Codec::from_tag(head[4])?;
        let data_len = u32::from_le_bytes(head[5..9].try_into().unwrap());
        if orig_size as usize > MAX_CHUNK_SIZE || data_len as usize > MAX_CHUNK_SIZE {
            return Err(WalbakError::Protocol(format!(
                "oversized chunk on the wire: orig {orig_size}, encoded {data_len}"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        pkt.read_raw(&mut data)?;
        Ok(CompressedChunk {
            orig_size,
            codec,
            data,
        })
    }
}

/// Pipeline stage: pop plain chunks, push encoded ones.
///
/// On error the stage fails its input (to unblock upstream) and its output
/// (to wake downstream), then reports to the joining supervisor.
pub fn compress_worker(
    in_q: &BoundedQueue<CompressedChunk>,
    out_q: &BoundedQueue<CompressedChunk>,
    codec: Codec,
) -> Result<()> {
    let result = (|| {
        while let Some(chunk) = in_q.pop()? {
            out_q.push(chunk.compress(codec)?)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            out_q.sync();
            Ok(())
        }
        Err(e) => {
            in_q.fail();
            out_q.fail();
            Err(e)
        }
    }
}

/// Pipeline stage: pop encoded chunks, push plain ones.
pub fn uncompress_worker(
    in_q: &BoundedQueue<CompressedChunk>,
    out_q: &BoundedQueue<CompressedChunk>,
) -> Result<()> {
    let result = (|| {
        while let Some(chunk) = in_q.pop()? {
            out_q.push(chunk.uncompress()?)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            out_q.sync();
            Ok(())
        }
        Err(e) => {
            in_q.fail();
            out_q.fail();
            Err(e)
        }
    }
}
