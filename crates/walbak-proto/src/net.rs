//! Socket setup: connect timeouts, read/write deadlines, TCP keep-alive.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use walbak_types::error::{Result, WalbakError};

/// TCP keep-alive knobs. When enabled, keep-alive replaces the read/write
/// deadlines so that long idle transfers survive while dead peers do not.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveParams {
    pub enabled: bool,
    pub idle_s: u32,
    pub interval_s: u32,
    pub count: u32,
}

impl Default for KeepAliveParams {
    fn default() -> Self {
        KeepAliveParams {
            enabled: false,
            idle_s: 60,
            interval_s: 10,
            count: 6,
        }
    }
}

impl KeepAliveParams {
    pub fn verify(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.idle_s == 0 || self.interval_s == 0 || self.count == 0 {
            return Err(WalbakError::BadRequest(
                "TCP keep-alive parameters must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    Ok(stream)
}

/// Apply either keep-alive or socket deadlines to a connected stream.
pub fn set_socket_params(
    stream: &TcpStream,
    keep_alive: &KeepAliveParams,
    timeout: Duration,
) -> Result<()> {
    stream.set_nodelay(true)?;
    if keep_alive.enabled {
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        enable_keep_alive(stream, keep_alive)?;
    } else {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
    }
    Ok(())
}

fn enable_keep_alive(stream: &TcpStream, params: &KeepAliveParams) -> Result<()> {
    use nix::sys::socket::sockopt;
    use nix::sys::socket::setsockopt;

    setsockopt(stream, sockopt::KeepAlive, &true)
        .map_err(|e| WalbakError::Other(format!("SO_KEEPALIVE: {e}")))?;
    setsockopt(stream, sockopt::TcpKeepIdle, &params.idle_s)
        .map_err(|e| WalbakError::Other(format!("TCP_KEEPIDLE: {e}")))?;
    setsockopt(stream, sockopt::TcpKeepInterval, &params.interval_s)
        .map_err(|e| WalbakError::Other(format!("TCP_KEEPINTVL: {e}")))?;
    setsockopt(stream, sockopt::TcpKeepCount, &params.count)
        .map_err(|e| WalbakError::Other(format!("TCP_KEEPCNT: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_verify() {
        assert!(KeepAliveParams::default().verify().is_ok());
        let bad = KeepAliveParams {
            enabled: true,
            idle_s: 0,
            ..Default::default()
        };
        assert!(bad.verify().is_err());
    }
}
