//! Stream-control bytes framing a data-plane transfer.
//!
//! A transfer is `(Next chunk)* (End | Error)`. The receiver loops while it
//! sees `Next`; `Error` is a hard failure and the connection is torn down.

use std::io::{Read, Write};

use walbak_types::error::{Result, WalbakError};

use crate::packet::Packet;

const CTRL_NEXT: u8 = 0;
const CTRL_END: u8 = 1;
const CTRL_ERROR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctrl {
    Next,
    End,
    Error,
}

impl<S: Read + Write> Packet<S> {
    pub fn write_ctrl(&mut self, ctrl: Ctrl) -> Result<()> {
        let b = match ctrl {
            Ctrl::Next => CTRL_NEXT,
            Ctrl::End => CTRL_END,
            Ctrl::Error => CTRL_ERROR,
        };
        self.write_raw(&[b])
    }

    pub fn read_ctrl(&mut self) -> Result<Ctrl> {
        let mut b = [0u8; 1];
        self.read_raw(&mut b)?;
        match b[0] {
            CTRL_NEXT => Ok(Ctrl::Next),
            CTRL_END => Ok(Ctrl::End),
            CTRL_ERROR => Ok(Ctrl::Error),
            other => Err(WalbakError::Protocol(format!(
                "bad stream control byte: {other}"
            ))),
        }
    }
}

/// Best-effort error terminator for a sender that failed mid-stream.
/// Swallows I/O errors: the peer may already be gone.
pub fn try_send_error<S: Read + Write>(pkt: &mut Packet<S>) {
    let _ = pkt.write_ctrl(Ctrl::Error);
    let _ = pkt.flush();
}
