//! The proxy daemon: converts incoming wlog streams into wdiff files and
//! fans them out to the configured archives, absorbing archive downtime.
//!
//! Layout per volume: the master copy of each received wdiff is hard-linked
//! into one send queue directory per archive, then removed; each queue
//! drains independently, so one slow archive never blocks another.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use walbak_core::compress::Codec;
use walbak_core::counter::{ActionCounterTransaction, ActionCounters};
use walbak_core::diff::{DiffFileHeader, DiffMemory, DiffReader, DiffRecord, DiffWriter, RecIo};
use walbak_core::meta::MetaDiff;
use walbak_core::registry::VolumeRegistry;
use walbak_core::state_machine::StateMachine;
use walbak_core::stop::{verify_not_stopping, AtomicStopState, Notifier, Stopper};
use walbak_core::volume::{load_obj, save_obj, VolumeDir};
use walbak_core::wdiff_net::send_diff;
use walbak_core::wlog::WlogRecKind;
use walbak_core::wlog_net::recv_wlog;
use walbak_proto::msg;
use walbak_proto::packet::Packet;
use walbak_types::error::{Result, WalbakError};
use walbak_types::uuid::Uuid;

use crate::ctl::CtlClient;
use crate::dispatch::{recv_params, reply_ok, reply_ok_with, with_error_reply, Handler, ServerParams};

pub const P_CLEAR: &str = "Clear";
pub const P_STOPPED: &str = "Stopped";
pub const P_STARTED: &str = "Started";

const PT_INIT_VOL: &str = "tInitVol";
const PT_CLEAR_VOL: &str = "tClearVol";
const PT_START: &str = "tStart";
const PT_STOP: &str = "tStop";
const PT_WLOG_RECV: &str = "tWlogRecv";
const PT_ADD_ARCHIVE_INFO: &str = "tAddArchiveInfo";
const PT_DELETE_ARCHIVE_INFO: &str = "tDeleteArchiveInfo";

pub const ACT_WDIFF_SEND: &str = "WdiffSend";
/// In-flight wlog receive; lets a stop tell a live transient from a
/// stranded one.
pub const ACT_WLOG_RECV: &str = "WlogRecv";

const STATE_TABLE: &[(&str, &str)] = &[
    (P_CLEAR, PT_INIT_VOL),
    (PT_INIT_VOL, P_STOPPED),
    (P_STOPPED, PT_CLEAR_VOL),
    (PT_CLEAR_VOL, P_CLEAR),
    (P_STOPPED, PT_START),
    (PT_START, P_STARTED),
    (P_STARTED, PT_STOP),
    (PT_STOP, P_STOPPED),
    (P_STARTED, PT_WLOG_RECV),
    (PT_WLOG_RECV, P_STARTED),
    (P_STOPPED, PT_ADD_ARCHIVE_INFO),
    (PT_ADD_ARCHIVE_INFO, P_STOPPED),
    (P_STOPPED, PT_DELETE_ARCHIVE_INFO),
    (PT_DELETE_ARCHIVE_INFO, P_STOPPED),
];

const REST_STATES: [&str; 3] = [P_CLEAR, P_STOPPED, P_STARTED];
const STOP_TIMEOUT: Duration = Duration::from_secs(600);

const ARCHIVE_INFO_FILE: &str = "archive_info";
const SEND_DIR: &str = "send";

/// One fan-out target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub addr: String,
}

pub struct ProxyVolState {
    pub notifier: Arc<Notifier>,
    pub stop: AtomicStopState,
    pub sm: StateMachine,
    pub ac: ActionCounters,
}

pub struct ProxyNode {
    pub node_id: String,
    pub base_dir: PathBuf,
    reg: VolumeRegistry<ProxyVolState>,
}

impl ProxyNode {
    pub fn new(node_id: &str, base_dir: &Path) -> Arc<Self> {
        let dir = base_dir.to_path_buf();
        Arc::new(ProxyNode {
            node_id: node_id.to_string(),
            base_dir: base_dir.to_path_buf(),
            reg: VolumeRegistry::new(move |vol| rehydrate(&dir, vol)),
        })
    }

    pub fn vol_state(&self, vol: &str) -> Arc<ProxyVolState> {
        self.reg.get(vol)
    }

    fn vol_dir(&self, vol: &str) -> Result<VolumeDir> {
        VolumeDir::new(&self.base_dir, vol)
    }

    pub fn handlers() -> HashMap<&'static str, Handler<ProxyNode>> {
        let mut h: HashMap<&'static str, Handler<ProxyNode>> = HashMap::new();
        h.insert(msg::CMD_STATUS, c2p_status);
        h.insert(msg::CMD_INIT_VOL, c2p_init_vol);
        h.insert(msg::CMD_CLEAR_VOL, c2p_clear_vol);
        h.insert(msg::CMD_START, c2p_start);
        h.insert(msg::CMD_STOP, c2p_stop);
        h.insert(msg::CMD_ARCHIVE_INFO, c2p_archive_info);
        h.insert(msg::CMD_KICK, c2p_kick);
        h.insert(msg::CMD_GET, c2p_get);
        h.insert(msg::PROTO_WLOG_TRANSFER, s2p_wlog_transfer);
        h
    }
}

fn rehydrate(base_dir: &Path, vol: &str) -> ProxyVolState {
    let notifier = Arc::new(Notifier::new());
    let sm = StateMachine::new(P_CLEAR, STATE_TABLE, Arc::clone(&notifier));
    let ac = ActionCounters::new(Arc::clone(&notifier));
    match VolumeDir::new(base_dir, vol) {
        Ok(vd) if vd.exists() => match vd.get_state() {
            Ok(state) => {
                if let Err(e) = sm.set(&state) {
                    warn!(vol, error = %e, "ignoring bad persisted state");
                }
            }
            Err(e) => warn!(vol, error = %e, "no persisted state"),
        },
        _ => {}
    }
    ProxyVolState {
        notifier,
        stop: AtomicStopState::new(),
        sm,
        ac,
    }
}

fn load_archive_infos(vd: &VolumeDir) -> Result<Vec<ArchiveInfo>> {
    if !vd.path().join(ARCHIVE_INFO_FILE).exists() {
        return Ok(Vec::new());
    }
    load_obj(vd.path(), ARCHIVE_INFO_FILE)
}

fn save_archive_infos(vd: &VolumeDir, infos: &[ArchiveInfo]) -> Result<()> {
    save_obj(vd.path(), ARCHIVE_INFO_FILE, &infos.to_vec())
}

fn send_queue_dir(vd: &VolumeDir, archive_name: &str) -> PathBuf {
    vd.path().join(SEND_DIR).join(archive_name)
}


// ── Control commands ───────────────────────────────────────────────────────

fn c2p_status(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params: Vec<String> = pkt.read()?;
        let mut lines = Vec::new();
        if params.is_empty() {
            for vol in walbak_core::volume::list_volumes(&node.base_dir)? {
                let st = node.vol_state(&vol);
                lines.push(format!("{vol} {}", st.sm.get()));
            }
        } else {
            let vol = &params[0];
            let st = node.vol_state(vol);
            let vd = node.vol_dir(vol)?;
            lines.push(format!("state {}", st.sm.get()));
            for info in load_archive_infos(&vd)? {
                let pending = pending_files(&send_queue_dir(&vd, &info.name))?.len();
                lines.push(format!("archive {} {} pending {pending}", info.name, info.addr));
            }
        }
        reply_ok_with(pkt, &lines)
    })
}

fn c2p_init_vol(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        let tran = st.sm.transaction(vol, P_CLEAR, PT_INIT_VOL)?;
        let vd = node.vol_dir(vol)?;
        vd.create()?;
        vd.set_state(P_STOPPED)?;
        tran.commit(P_STOPPED)?;
        info!(vol, "volume initialized");
        reply_ok(pkt)
    })
}

fn c2p_clear_vol(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        if !st.ac.is_all_zero(&[ACT_WDIFF_SEND]) {
            return Err(WalbakError::BadRequest(format!(
                "volume '{vol}' is forwarding wdiffs"
            )));
        }
        let tran = st.sm.transaction(vol, P_STOPPED, PT_CLEAR_VOL)?;
        node.vol_dir(vol)?.remove_all()?;
        tran.commit(P_CLEAR)?;
        node.reg.remove(vol);
        info!(vol, "volume cleared");
        reply_ok(pkt)
    })
}

fn c2p_start(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let tran = st.sm.transaction(vol, P_STOPPED, PT_START)?;
        let vd = node.vol_dir(vol)?;
        vd.set_state(P_STARTED)?;
        tran.commit(P_STARTED)?;
        reply_ok(pkt)
    })
}

fn c2p_stop(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    let params = recv_params(&mut pkt, 2)?;
    let vol = &params[0];
    let is_force = params[1] != "0";
    let st = node.vol_state(vol);

    reply_ok(&mut pkt)?;

    let stopper = Stopper::new(&st.stop, is_force);
    if !stopper.is_success() {
        return Ok(());
    }

    // A stranded tWlogRecv counts as drained: its transfer has terminated
    // and only a reset can move it on.
    st.notifier.wait_until(
        || {
            let cur = st.sm.get();
            st.ac.is_all_zero(&[ACT_WDIFF_SEND, ACT_WLOG_RECV])
                && (REST_STATES.contains(&cur.as_str()) || cur == PT_WLOG_RECV)
        },
        STOP_TIMEOUT,
        "proxy stop drain",
    )?;

    if st.sm.get() != P_STARTED {
        return Ok(());
    }
    let tran = st.sm.transaction(vol, P_STARTED, PT_STOP)?;
    let vd = node.vol_dir(vol)?;
    vd.set_state(P_STOPPED)?;
    tran.commit(P_STOPPED)?;
    info!(vol, "stopped");
    Ok(())
}

fn c2p_archive_info(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 0)?;
        let sub = params
            .first()
            .ok_or_else(|| WalbakError::BadRequest("missing archive-info subcommand".into()))?;
        let vol = params
            .get(1)
            .ok_or_else(|| WalbakError::BadRequest("missing volume id".into()))?;
        let st = node.vol_state(vol);
        let vd = node.vol_dir(vol)?;
        let mut infos = load_archive_infos(&vd)?;

        let lines: Vec<String> = match sub.as_str() {
            "list" => infos.iter().map(|i| format!("{} {}", i.name, i.addr)).collect(),
            "get" => {
                let name = params
                    .get(2)
                    .ok_or_else(|| WalbakError::BadRequest("missing archive name".into()))?;
                let info = infos
                    .iter()
                    .find(|i| &i.name == name)
                    .ok_or_else(|| {
                        WalbakError::BadRequest(format!("no archive '{name}'"))
                    })?;
                vec![format!("{} {}", info.name, info.addr)]
            }
            "add" | "update" => {
                let name = params
                    .get(2)
                    .ok_or_else(|| WalbakError::BadRequest("missing archive name".into()))?;
                let addr = params
                    .get(3)
                    .ok_or_else(|| WalbakError::BadRequest("missing archive address".into()))?;
                addr.parse::<std::net::SocketAddr>()
                    .map_err(|_| WalbakError::BadRequest(format!("bad address '{addr}'")))?;
                let tran = st.sm.transaction(vol, P_STOPPED, PT_ADD_ARCHIVE_INFO)?;
                let exists = infos.iter().position(|i| &i.name == name);
                match (sub.as_str(), exists) {
                    ("add", Some(_)) => {
                        return Err(WalbakError::BadRequest(format!(
                            "archive '{name}' already exists"
                        )))
                    }
                    ("add", None) => infos.push(ArchiveInfo {
                        name: name.clone(),
                        addr: addr.clone(),
                    }),
                    ("update", Some(i)) => infos[i].addr = addr.clone(),
                    ("update", None) => {
                        return Err(WalbakError::BadRequest(format!("no archive '{name}'")))
                    }
                    _ => unreachable!(),
                }
                std::fs::create_dir_all(send_queue_dir(&vd, name))?;
                save_archive_infos(&vd, &infos)?;
                tran.commit(P_STOPPED)?;
                Vec::new()
            }
            "delete" => {
                let name = params
                    .get(2)
                    .ok_or_else(|| WalbakError::BadRequest("missing archive name".into()))?;
                let tran = st.sm.transaction(vol, P_STOPPED, PT_DELETE_ARCHIVE_INFO)?;
                let before = infos.len();
                infos.retain(|i| &i.name != name);
                if infos.len() == before {
                    return Err(WalbakError::BadRequest(format!("no archive '{name}'")));
                }
                save_archive_infos(&vd, &infos)?;
                let dir = send_queue_dir(&vd, name);
                if dir.is_dir() {
                    std::fs::remove_dir_all(dir)?;
                }
                tran.commit(P_STOPPED)?;
                Vec::new()
            }
            other => {
                return Err(WalbakError::BadRequest(format!(
                    "bad archive-info subcommand '{other}'"
                )))
            }
        };
        reply_ok_with(pkt, &lines)
    })
}

fn c2p_kick(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params: Vec<String> = pkt.read()?;
        let vols = if params.is_empty() {
            walbak_core::volume::list_volumes(&node.base_dir)?
        } else {
            vec![params[0].clone()]
        };
        for vol in vols {
            if let Err(e) = drain_send_queues(node, &vol) {
                warn!(vol, error = %e, "wdiff forwarding failed; will retry on next kick");
            }
        }
        reply_ok(pkt)
    })
}

fn c2p_get(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 0)?;
        let target = params
            .first()
            .ok_or_else(|| WalbakError::BadRequest("no get target".into()))?;
        let arg = params.get(1).map(|s| s.as_str());
        let need_vol = || {
            arg.ok_or_else(|| WalbakError::BadRequest(format!("get {target} needs a volume")))
        };
        let lines: Vec<String> = match target.as_str() {
            msg::GET_HOST_TYPE => vec![msg::HOST_PROXY.to_string()],
            msg::GET_PID => vec![std::process::id().to_string()],
            msg::GET_VOL => walbak_core::volume::list_volumes(&node.base_dir)?,
            msg::GET_STATE => vec![node.vol_state(need_vol()?).sm.get()],
            other => {
                return Err(WalbakError::BadRequest(format!("no such target {other}")))
            }
        };
        reply_ok_with(pkt, &lines)
    })
}

// ── Data plane ─────────────────────────────────────────────────────────────

/// WLog transfer server: land one diff's worth of wlogs as a wdiff and queue
/// it toward every archive.
fn s2p_wlog_transfer(node: &ProxyNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let vol: String = pkt.read()?;
        if vol.is_empty() {
            return Err(WalbakError::BadRequest("empty volume id".into()));
        }
        let uuid: Uuid = pkt.read()?;
        let salt: u32 = pkt.read()?;
        let size_lb: u64 = pkt.read()?;
        let diff: MetaDiff = pkt.read()?;

        let st = node.vol_state(&vol);
        verify_not_stopping(&st.stop, &vol)?;
        let vd = node.vol_dir(&vol)?;
        if !vd.exists() {
            return Err(WalbakError::BadRequest(format!("unknown volume '{vol}'")));
        }

        let tran = st.sm.transaction(&vol, P_STARTED, PT_WLOG_RECV)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_WLOG_RECV);
        reply_ok(pkt)?;
        *sent_ok = true;

        let run = || -> Result<usize> {
            // Fold the incoming packs into a compacted record set.
            let mut mem = DiffMemory::new();
            recv_wlog(p.sock, salt, |pack| {
                if st.stop.is_force_stopping() {
                    return Err(WalbakError::Stopping(vol.clone()));
                }
                for (rec, data) in pack.header.records.iter().zip(pack.ios) {
                    match rec.kind {
                        WlogRecKind::Normal => {
                            mem.insert(RecIo::new(DiffRecord::normal(rec.offset_lb, &data)?, data));
                        }
                        WlogRecKind::Discard => {
                            mem.insert(RecIo::new(
                                DiffRecord::discard(rec.offset_lb, rec.io_size_lb),
                                Vec::new(),
                            ));
                        }
                        WlogRecKind::Padding => {}
                    }
                }
                Ok(())
            })?;

            let records = mem.into_records();
            let max_io_blocks = records.iter().map(|r| r.rec.io_blocks).max().unwrap_or(0);
            let tmp = tempfile::NamedTempFile::new_in(vd.path())?;
            let mut writer = DiffWriter::new(BufWriter::new(tmp.as_file()));
            writer.write_header(&DiffFileHeader {
                uuid,
                max_io_blocks,
                diff,
            })?;
            let n = records.len();
            for rio in records {
                writer.add_record(rio.rec, rio.data)?;
            }
            writer.finish()?;

            // Master copy, then one hard link per archive queue.
            let master = vd.wdiff_path(&diff);
            tmp.persist(&master).map_err(|e| WalbakError::Io(e.error))?;
            vd.set_size_lb(size_lb)?;
            vd.set_uuid(&uuid)?;
            for info in load_archive_infos(&vd)? {
                let dir = send_queue_dir(&vd, &info.name);
                std::fs::create_dir_all(&dir)?;
                let target = dir.join(diff.file_name());
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                std::fs::hard_link(&master, &target)?;
            }
            std::fs::remove_file(&master)?;
            Ok(n)
        };
        match run() {
            Ok(n) => {
                tran.commit(P_STARTED)?;
                pkt.send_ack()?;
                info!(vol, diff = %diff, records = n, "wlog landed as wdiff");
            }
            Err(e) => {
                warn!(vol, error = %e, "wlog receive failed; volume left in transient state");
                tran.leave_transient();
                return Err(e);
            }
        }

        // Opportunistic forward; archives may be down, the queue keeps it.
        if let Err(e) = drain_send_queues(node, &vol) {
            warn!(vol, error = %e, "forwarding deferred");
        }
        Ok(())
    })
}

/// Push every queued wdiff to its archive, oldest first. A non-fatal
/// rejection (`too-new-diff`, `stopped`, ...) parks the queue until the next
/// kick; `too-old-diff` discards the file.
fn drain_send_queues(node: &ProxyNode, vol: &str) -> Result<()> {
    let st = node.vol_state(vol);
    verify_not_stopping(&st.stop, vol)?;
    let vd = node.vol_dir(vol)?;
    if !vd.exists() {
        return Ok(());
    }
    let _act = ActionCounterTransaction::new(&st.ac, ACT_WDIFF_SEND);
    let uuid = vd.get_uuid()?;
    let size_lb = vd.get_size_lb()?;

    for info in load_archive_infos(&vd)? {
        let addr: std::net::SocketAddr = info
            .addr
            .parse()
            .map_err(|_| WalbakError::BadRequest(format!("bad address '{}'", info.addr)))?;
        let dir = send_queue_dir(&vd, &info.name);
        for path in pending_files(&dir)? {
            if st.stop.is_force_stopping() {
                return Err(WalbakError::Stopping(vol.to_string()));
            }
            match send_one_wdiff(node, vol, &path, addr, uuid, size_lb) {
                Ok(SendResult::Delivered) | Ok(SendResult::Obsolete) => {
                    std::fs::remove_file(&path)?;
                }
                Ok(SendResult::Parked(reason)) => {
                    info!(vol, archive = %info.name, reason, "send queue parked");
                    break;
                }
                Err(e) => {
                    warn!(vol, archive = %info.name, error = %e, "wdiff send failed");
                    break;
                }
            }
        }
    }
    Ok(())
}

enum SendResult {
    Delivered,
    /// The archive is already past this diff.
    Obsolete,
    /// Retry later; the queue stays as is.
    Parked(&'static str),
}

fn send_one_wdiff(
    node: &ProxyNode,
    vol: &str,
    path: &Path,
    addr: std::net::SocketAddr,
    uuid: Uuid,
    size_lb: u64,
) -> Result<SendResult> {
    let size_b = std::fs::metadata(path)?.len();
    let mut reader = DiffReader::new(BufReader::new(File::open(path)?), size_b)?;
    let header = *reader.header();

    let ctl = CtlClient::new(addr, &node.node_id);
    let sock = ctl.open(msg::PROTO_WDIFF_TRANSFER)?;
    let mut apkt = Packet::new(&sock);
    apkt.write(&vol)?;
    apkt.write(&msg::HOST_PROXY)?;
    apkt.write(&uuid)?;
    apkt.write(&header.max_io_blocks)?;
    apkt.write(&size_lb)?;
    apkt.write(&header.diff)?;
    apkt.flush()?;

    let res: String = apkt.read()?;
    match res.as_str() {
        msg::OK => {}
        msg::TOO_OLD_DIFF => return Ok(SendResult::Obsolete),
        msg::TOO_NEW_DIFF => return Ok(SendResult::Parked("too-new-diff")),
        msg::STOPPED => return Ok(SendResult::Parked("stopped")),
        msg::ARCHIVE_NOT_FOUND => return Ok(SendResult::Parked("archive-not-found")),
        msg::DIFFERENT_UUID => return Ok(SendResult::Parked("different-uuid")),
        other => return Err(WalbakError::Rejected(other.to_string())),
    }

    send_diff(&sock, Codec::Snappy, move || reader.read_record())?;
    apkt.recv_ack()?;
    info!(vol, diff = %header.diff, "wdiff delivered");
    Ok(SendResult::Delivered)
}

fn pending_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".wdiff") {
            files.push(entry.path());
        }
    }
    // Names begin with the begin-gid, so lexical order is not numeric
    // order; sort by the parsed begin gid.
    files.sort_by_key(|p| {
        p.file_name()
            .and_then(|n| n.to_string_lossy().split('-').next().map(str::to_string))
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(u64::MAX)
    });
    Ok(files)
}
