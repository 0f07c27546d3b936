use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use walbak_types::error::{Result, WalbakError};

/// Upper bound for one serialized value frame. Bulk data does not travel
/// through value frames, so this only needs to cover metadata.
const MAX_VALUE_FRAME: u32 = 16 << 20;

const ACK_TOKEN: &str = "ack";

/// Length-prefixed MessagePack value frames over a byte stream.
///
/// Every value is one `u32` little-endian length followed by the rmp-serde
/// encoding. Bulk payloads bypass this and use `write_raw`/`read_raw`.
pub struct Packet<S> {
    stream: S,
}

impl<S: Read + Write> Packet<S> {
    pub fn new(stream: S) -> Self {
        Packet { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = rmp_serde::to_vec(value)?;
        if body.len() as u64 > MAX_VALUE_FRAME as u64 {
            return Err(WalbakError::Protocol(format!(
                "value frame too large: {} bytes",
                body.len()
            )));
        }
        self.stream.write_all(&(body.len() as u32).to_le_bytes())?;
        self.stream.write_all(&body)?;
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_VALUE_FRAME {
            return Err(WalbakError::Protocol(format!(
                "incoming value frame too large: {len} bytes"
            )));
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body)?;
        Ok(rmp_serde::from_slice(&body)?)
    }

    /// Write bytes with no framing. The receiver must know the length.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    pub fn send_ack(&mut self) -> Result<()> {
        self.write(&ACK_TOKEN)
    }

    pub fn recv_ack(&mut self) -> Result<()> {
        let token: String = self.read()?;
        if token != ACK_TOKEN {
            return Err(WalbakError::Protocol(format!("expected ack, got '{token}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Read+Write over a single growable buffer; reads consume from the front
    /// of what writes appended.
    struct Loopback(Cursor<Vec<u8>>);

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let pos = self.0.position();
            self.0.set_position(self.0.get_ref().len() as u64);
            let n = self.0.write(buf)?;
            self.0.set_position(pos);
            Ok(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn value_roundtrip() {
        let mut pkt = Packet::new(Loopback(Cursor::new(Vec::new())));
        pkt.write(&("vol0".to_string(), 42u64)).unwrap();
        pkt.write(&"ok".to_string()).unwrap();
        let (vol, n): (String, u64) = pkt.read().unwrap();
        assert_eq!((vol.as_str(), n), ("vol0", 42));
        let msg: String = pkt.read().unwrap();
        assert_eq!(msg, "ok");
    }

    #[test]
    fn raw_roundtrip() {
        let mut pkt = Packet::new(Loopback(Cursor::new(Vec::new())));
        pkt.write_raw(&[1, 2, 3, 4, 5]).unwrap();
        let mut buf = [0u8; 5];
        pkt.read_raw(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn ack_roundtrip() {
        let mut pkt = Packet::new(Loopback(Cursor::new(Vec::new())));
        pkt.send_ack().unwrap();
        pkt.recv_ack().unwrap();
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(MAX_VALUE_FRAME + 1).to_le_bytes());
        let mut pkt = Packet::new(Loopback(Cursor::new(raw)));
        assert!(pkt.read::<String>().is_err());
    }
}
