//! The first negotiate run on every new connection, before any command
//! payload: client identity, requested protocol, version check.

use std::io::{Read, Write};

use walbak_types::error::{Result, WalbakError};

use crate::msg;
use crate::packet::Packet;
use crate::PROTOCOL_VERSION;

/// Client side. Returns the server id once the server accepted the protocol.
pub fn run_as_client<S: Read + Write>(
    pkt: &mut Packet<S>,
    client_id: &str,
    protocol_name: &str,
) -> Result<String> {
    pkt.write(&client_id)?;
    pkt.write(&protocol_name)?;
    pkt.write(&PROTOCOL_VERSION)?;
    pkt.flush()?;

    let server_id: String = pkt.read()?;
    let reply: String = pkt.read()?;
    if reply != msg::OK {
        return Err(WalbakError::Rejected(reply));
    }
    Ok(server_id)
}

/// Server side, up to the version check. The caller looks up the handler and
/// sends `ok` (or the error text) itself, so that an unknown protocol name is
/// reported through the same channel.
pub fn run_as_server<S: Read + Write>(
    pkt: &mut Packet<S>,
    server_id: &str,
) -> Result<(String, String)> {
    let client_id: String = pkt.read()?;
    let protocol_name: String = pkt.read()?;
    let version: u32 = pkt.read()?;
    pkt.write(&server_id)?;
    pkt.flush()?;

    if version != PROTOCOL_VERSION {
        return Err(WalbakError::Protocol(format!(
            "protocol version mismatch: client {version}, server {PROTOCOL_VERSION}"
        )));
    }
    if client_id.is_empty() {
        return Err(WalbakError::BadRequest("empty client id".into()));
    }
    Ok((client_id, protocol_name))
}
