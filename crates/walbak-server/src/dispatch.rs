//! Connection dispatch shared by the three daemons.
//!
//! One accept thread; each inbound connection runs on its own worker thread:
//! negotiate, look up the handler for the requested protocol, reply `ok`,
//! run the handler. `shutdown` is handled here and flips the process-wide
//! status; the accept loop observes it on its next wakeup (the shutdown
//! connection itself provides one).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use walbak_proto::msg;
use walbak_proto::negotiate;
use walbak_proto::net::{set_socket_params, KeepAliveParams};
use walbak_proto::packet::Packet;
use walbak_types::error::{Result, WalbakError};

const RUNNING: u8 = 0;
const GRACEFUL_SHUTDOWN: u8 = 1;
const FORCE_SHUTDOWN: u8 = 2;

/// Process-wide status. Atomic-only; read from every worker.
#[derive(Default)]
pub struct ProcessStatus(AtomicU8);

impl ProcessStatus {
    pub fn new() -> Self {
        ProcessStatus(AtomicU8::new(RUNNING))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_force_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire) == FORCE_SHUTDOWN
    }

    pub fn set_graceful_shutdown(&self) {
        self.0.store(GRACEFUL_SHUTDOWN, Ordering::Release);
    }

    pub fn set_force_shutdown(&self) {
        self.0.store(FORCE_SHUTDOWN, Ordering::Release);
    }
}

/// Per-connection context handed to command handlers.
pub struct ServerParams<'a> {
    pub sock: &'a TcpStream,
    pub client_id: String,
    pub ps: &'a ProcessStatus,
}

pub type Handler<N> = fn(&N, &mut ServerParams<'_>) -> Result<()>;

/// Per-daemon dispatch configuration.
pub struct ServerConfig {
    pub node_id: String,
    pub keep_alive: KeepAliveParams,
    pub socket_timeout: Duration,
}

/// Run the accept loop until a shutdown command arrives.
pub fn serve<N: Send + Sync + 'static>(
    listener: TcpListener,
    node: Arc<N>,
    config: ServerConfig,
    handlers: HashMap<&'static str, Handler<N>>,
) -> Result<()> {
    let config = Arc::new(config);
    let handlers = Arc::new(handlers);
    let ps = Arc::new(ProcessStatus::new());
    let mut workers: Vec<std::thread::JoinHandle<()>> = Vec::new();

    info!(node = %config.node_id, addr = %listener.local_addr()?, "listening");
    // The shutdown command is handled on a worker thread, so the accept
    // side polls rather than blocking indefinitely.
    listener.set_nonblocking(true)?;
    while ps.is_running() {
        let (sock, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = sock.set_nonblocking(false) {
            warn!(peer = %peer, error = %e, "socket setup failed");
            continue;
        }
        if let Err(e) = set_socket_params(&sock, &config.keep_alive, config.socket_timeout) {
            warn!(peer = %peer, error = %e, "socket setup failed");
            continue;
        }
        let node = Arc::clone(&node);
        let config = Arc::clone(&config);
        let handlers = Arc::clone(&handlers);
        let ps = Arc::clone(&ps);
        workers.push(std::thread::spawn(move || {
            handle_connection::<N>(&sock, &node, &config, &handlers, &ps);
        }));
        workers.retain(|w| !w.is_finished());
    }

    if !ps.is_force_shutdown() {
        for w in workers {
            let _ = w.join();
        }
    }
    info!(node = %config.node_id, "server loop finished");
    Ok(())
}

fn handle_connection<N>(
    sock: &TcpStream,
    node: &N,
    config: &ServerConfig,
    handlers: &HashMap<&'static str, Handler<N>>,
    ps: &ProcessStatus,
) {
    let mut pkt = Packet::new(sock);
    let (client_id, protocol_name) = match negotiate::run_as_server(&mut pkt, &config.node_id) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "negotiate failed");
            let _ = pkt.write(&e.wire_message());
            return;
        }
    };

    if protocol_name == msg::CMD_SHUTDOWN {
        if let Err(e) = pkt.write(&msg::OK).and_then(|_| shutdown_server(&mut pkt, ps)) {
            error!(client = %client_id, error = %e, "shutdown handling failed");
        }
        return;
    }

    let Some(handler) = handlers.get(protocol_name.as_str()) else {
        warn!(client = %client_id, protocol = %protocol_name, "unknown protocol");
        let _ = pkt.write(&format!("unknown protocol: {protocol_name}"));
        return;
    };
    if let Err(e) = pkt.write(&msg::OK).and_then(|_| pkt.flush()) {
        warn!(client = %client_id, error = %e, "reply failed");
        return;
    }

    let mut params = ServerParams {
        sock,
        client_id: client_id.clone(),
        ps,
    };
    if let Err(e) = handler(node, &mut params) {
        // Handlers reply their own error text where the protocol allows;
        // here we only record the failure.
        error!(client = %client_id, protocol = %protocol_name, error = %e, "handler failed");
    }
}

fn shutdown_server<S: Read + Write>(pkt: &mut Packet<S>, ps: &ProcessStatus) -> Result<()> {
    let is_force: bool = pkt.read()?;
    if is_force {
        ps.set_force_shutdown();
    } else {
        ps.set_graceful_shutdown();
    }
    info!(force = is_force, "shutdown requested");
    pkt.write(&msg::ACCEPT)?;
    pkt.flush()
}

// ── Handler-side reply helpers ─────────────────────────────────────────────

/// Run a handler body; when it fails before `ok` went out, send the error
/// text so the controller sees a reason rather than a dropped connection.
/// The body flips the flag right after replying `ok`.
pub fn with_error_reply<F>(pkt: &mut Packet<&TcpStream>, f: F) -> Result<()>
where
    F: FnOnce(&mut Packet<&TcpStream>, &mut bool) -> Result<()>,
{
    let mut sent_ok = false;
    match f(pkt, &mut sent_ok) {
        Ok(()) => Ok(()),
        Err(e) => {
            if !sent_ok {
                let _ = pkt.write(&e.wire_message());
                let _ = pkt.flush();
            }
            Err(e)
        }
    }
}

/// Reply `ok` with no payload.
pub fn reply_ok<S: Read + Write>(pkt: &mut Packet<S>) -> Result<()> {
    pkt.write(&msg::OK)?;
    pkt.flush()
}

/// Reply `ok` followed by one payload value.
pub fn reply_ok_with<S: Read + Write, T: serde::Serialize>(
    pkt: &mut Packet<S>,
    value: &T,
) -> Result<()> {
    pkt.write(&msg::OK)?;
    pkt.write(value)?;
    pkt.flush()
}

/// Reply an error message and return it as the handler error.
pub fn reply_err<S: Read + Write>(pkt: &mut Packet<S>, err: WalbakError) -> Result<()> {
    let _ = pkt.write(&err.wire_message());
    let _ = pkt.flush();
    Err(err)
}

/// Read the command's string parameters, enforcing a count when nonzero.
pub fn recv_params<S: Read + Write>(pkt: &mut Packet<S>, expect: usize) -> Result<Vec<String>> {
    let params: Vec<String> = pkt.read()?;
    if expect != 0 && params.len() != expect {
        return Err(WalbakError::BadRequest(format!(
            "expected {expect} parameters, got {}",
            params.len()
        )));
    }
    if params.iter().any(|p| p.is_empty()) {
        return Err(WalbakError::BadRequest("empty parameter".into()));
    }
    Ok(params)
}
