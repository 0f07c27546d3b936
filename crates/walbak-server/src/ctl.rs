//! Client-side command functions: what the external controller (and the
//! integration tests) speak to a daemon, and what daemons use among
//! themselves for control commands.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use walbak_proto::msg;
use walbak_proto::negotiate;
use walbak_proto::net::{connect_with_timeout, set_socket_params, KeepAliveParams};
use walbak_proto::packet::Packet;
use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::Gid;

#[derive(Debug, Clone)]
pub struct CtlClient {
    pub addr: SocketAddr,
    pub client_id: String,
    pub timeout: Duration,
}

/// Read a status string; anything but `ok` is a peer rejection.
pub fn read_ok<S: Read + Write>(pkt: &mut Packet<S>) -> Result<()> {
    let status: String = pkt.read()?;
    if status != msg::OK {
        return Err(WalbakError::Rejected(status));
    }
    Ok(())
}

impl CtlClient {
    pub fn new(addr: SocketAddr, client_id: &str) -> Self {
        CtlClient {
            addr,
            client_id: client_id.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Connect and negotiate `protocol`. The caller continues the exchange.
    pub fn open(&self, protocol: &str) -> Result<TcpStream> {
        let sock = connect_with_timeout(self.addr, self.timeout)?;
        set_socket_params(&sock, &KeepAliveParams::default(), self.timeout)?;
        let mut pkt = Packet::new(&sock);
        negotiate::run_as_client(&mut pkt, &self.client_id, protocol)?;
        Ok(sock)
    }

    fn simple(&self, cmd: &str, params: &[&str]) -> Result<()> {
        let sock = self.open(cmd)?;
        let mut pkt = Packet::new(&sock);
        pkt.write(&params)?;
        pkt.flush()?;
        read_ok(&mut pkt)
    }

    fn with_payload<T: serde::de::DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[&str],
    ) -> Result<T> {
        let sock = self.open(cmd)?;
        let mut pkt = Packet::new(&sock);
        pkt.write(&params)?;
        pkt.flush()?;
        read_ok(&mut pkt)?;
        pkt.read()
    }

    pub fn status(&self, vol: Option<&str>) -> Result<Vec<String>> {
        let params: Vec<&str> = vol.into_iter().collect();
        self.with_payload(msg::CMD_STATUS, &params)
    }

    /// Storage wants `[vol, wdevPath]`; proxy and archive want `[vol]`.
    pub fn init_vol(&self, params: &[&str]) -> Result<()> {
        self.simple(msg::CMD_INIT_VOL, params)
    }

    pub fn clear_vol(&self, vol: &str) -> Result<()> {
        self.simple(msg::CMD_CLEAR_VOL, &[vol])
    }

    pub fn reset_vol(&self, vol: &str) -> Result<()> {
        self.simple(msg::CMD_RESET_VOL, &[vol])
    }

    /// Storage wants `[vol, "master"|"slave"]`; proxy and archive `[vol]`.
    pub fn start(&self, params: &[&str]) -> Result<()> {
        self.simple(msg::CMD_START, params)
    }

    pub fn stop(&self, vol: &str, is_force: bool) -> Result<()> {
        let force = if is_force { "1" } else { "0" };
        self.simple(msg::CMD_STOP, &[vol, force])
    }

    pub fn full_bkp(&self, vol: &str, bulk_lb: u64) -> Result<()> {
        self.simple(msg::CMD_FULL_BKP, &[vol, &bulk_lb.to_string()])
    }

    pub fn hash_bkp(&self, vol: &str, bulk_lb: u64) -> Result<()> {
        self.simple(msg::CMD_HASH_BKP, &[vol, &bulk_lb.to_string()])
    }

    pub fn snapshot(&self, vol: &str) -> Result<Gid> {
        self.with_payload(msg::CMD_SNAPSHOT, &[vol])
    }

    pub fn restore(&self, vol: &str, gid: Gid) -> Result<()> {
        self.simple(msg::CMD_RESTORE, &[vol, &gid.to_string()])
    }

    pub fn del_restored(&self, vol: &str, gid: Gid) -> Result<()> {
        self.simple(msg::CMD_DEL_RESTORED, &[vol, &gid.to_string()])
    }

    pub fn apply(&self, vol: &str, gid: Gid) -> Result<()> {
        self.simple(msg::CMD_APPLY, &[vol, &gid.to_string()])
    }

    pub fn merge(&self, vol: &str, gid_b: Gid, gid_e: Gid, max_size: &str) -> Result<()> {
        self.simple(
            msg::CMD_MERGE,
            &[vol, &gid_b.to_string(), &gid_e.to_string(), max_size],
        )
    }

    pub fn resize(&self, vol: &str, size: &str) -> Result<()> {
        self.simple(msg::CMD_RESIZE, &[vol, size])
    }

    pub fn replicate(&self, vol: &str, dst_addr: &str) -> Result<()> {
        self.simple(msg::CMD_REPLICATE, &[vol, dst_addr])
    }

    /// Proxy archive target management:
    /// `add <name> <addr>`, `update <name> <addr>`, `delete <name>`,
    /// `get <name>`, `list`.
    pub fn archive_info(&self, params: &[&str]) -> Result<Vec<String>> {
        self.with_payload(msg::CMD_ARCHIVE_INFO, params)
    }

    pub fn kick(&self, vol: Option<&str>) -> Result<()> {
        let params: Vec<&str> = vol.into_iter().collect();
        self.simple(msg::CMD_KICK, &params)
    }

    pub fn get(&self, params: &[&str]) -> Result<Vec<String>> {
        self.with_payload(msg::CMD_GET, params)
    }

    pub fn shutdown(&self, is_force: bool) -> Result<()> {
        let sock = self.open(msg::CMD_SHUTDOWN)?;
        let mut pkt = Packet::new(&sock);
        pkt.write(&is_force)?;
        pkt.flush()?;
        let reply: String = pkt.read()?;
        if reply != msg::ACCEPT {
            return Err(WalbakError::Rejected(reply));
        }
        Ok(())
    }

    /// Convenience for `get state <vol>`.
    pub fn get_state(&self, vol: &str) -> Result<String> {
        let mut v = self.get(&[msg::GET_STATE, vol])?;
        v.pop()
            .ok_or_else(|| WalbakError::Protocol("empty state reply".into()))
    }
}
