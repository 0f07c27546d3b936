//! The storage daemon: owns origin volumes bound to wlog-devices, runs
//! full/hash sync toward the archive and forwards wlogs to the proxy.
//!
//! The wlog-device is external; this daemon sees it as a data block device
//! plus a log stream of wlog packs (`<wdev>.wlog`) with a monotonic lsid,
//! and resets the written prefix by truncating the stream.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blake2::{Blake2s256, Digest};
use tracing::{info, warn};

use walbak_core::bdev::{SeqBdevReader, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IO_SIZE};
use walbak_core::compress::{Codec, CompressedChunk};
use walbak_core::counter::{ActionCounterTransaction, ActionCounters};
use walbak_core::diff::DiffRecord;
use walbak_core::fullsync::{send_full_image, send_gid_pair, SyncOutcome};
use walbak_core::meta::{MetaDiff, MetaState};
use walbak_core::registry::VolumeRegistry;
use walbak_core::state_machine::StateMachine;
use walbak_core::stop::{verify_not_stopping, AtomicStopState, Notifier, Stopper};
use walbak_core::throughput::ThroughputStabilizer;
use walbak_core::volume::VolumeDir;
use walbak_core::wlog::{WlogPack, WlogStreamReader};
use walbak_core::wlog_net::send_wlog;
use walbak_proto::msg;
use walbak_proto::packet::Packet;
use walbak_proto::stream::Ctrl;
use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::Snap;
use walbak_types::uuid::Uuid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::ctl::{read_ok, CtlClient};
use crate::dispatch::{recv_params, reply_ok, reply_ok_with, with_error_reply, Handler, ServerParams};

pub const S_CLEAR: &str = "Clear";
pub const S_SYNC_READY: &str = "SyncReady";
pub const S_STOPPED: &str = "Stopped";
pub const S_MASTER: &str = "Master";
pub const S_SLAVE: &str = "Slave";

const ST_INIT_VOL: &str = "tInitVol";
const ST_CLEAR_VOL: &str = "tClearVol";
const ST_START_SLAVE: &str = "tStartSlave";
const ST_STOP_SLAVE: &str = "tStopSlave";
const ST_WLOG_REMOVE: &str = "tWlogRemove";
const ST_FULL_SYNC: &str = "tFullSync";
const ST_HASH_SYNC: &str = "tHashSync";
const ST_RESET: &str = "tReset";
const ST_START_MASTER: &str = "tStartMaster";
const ST_STOP_MASTER: &str = "tStopMaster";
const ST_WLOG_SEND: &str = "tWlogSend";

const STATE_TABLE: &[(&str, &str)] = &[
    (S_CLEAR, ST_INIT_VOL),
    (ST_INIT_VOL, S_SYNC_READY),
    (S_SYNC_READY, ST_CLEAR_VOL),
    (ST_CLEAR_VOL, S_CLEAR),
    (S_SYNC_READY, ST_START_SLAVE),
    (ST_START_SLAVE, S_SLAVE),
    (S_SLAVE, ST_STOP_SLAVE),
    (ST_STOP_SLAVE, S_SYNC_READY),
    (S_SLAVE, ST_WLOG_REMOVE),
    (ST_WLOG_REMOVE, S_SLAVE),
    (S_SYNC_READY, ST_FULL_SYNC),
    (ST_FULL_SYNC, S_STOPPED),
    (S_SYNC_READY, ST_HASH_SYNC),
    (ST_HASH_SYNC, S_STOPPED),
    (S_STOPPED, ST_RESET),
    (ST_RESET, S_SYNC_READY),
    (S_STOPPED, ST_START_MASTER),
    (ST_START_MASTER, S_MASTER),
    (S_MASTER, ST_STOP_MASTER),
    (ST_STOP_MASTER, S_STOPPED),
    (S_MASTER, ST_WLOG_SEND),
    (ST_WLOG_SEND, S_MASTER),
];

const REST_STATES: [&str; 5] = [S_CLEAR, S_SYNC_READY, S_STOPPED, S_MASTER, S_SLAVE];

/// Transients a failed sync can strand a volume in; `reset-vol` recovers.
const STUCK_STATES: [&str; 2] = [ST_FULL_SYNC, ST_HASH_SYNC];

const STOP_TIMEOUT: Duration = Duration::from_secs(600);

/// In-flight transfer accounting, so a stop can tell a live transient from
/// a stranded one.
pub const ACT_FULL_SYNC: &str = "FullSync";
pub const ACT_HASH_SYNC: &str = "HashSync";
pub const ACT_WLOG_SEND: &str = "WlogSend";

const STORAGE_ACTIONS: [&str; 3] = [ACT_FULL_SYNC, ACT_HASH_SYNC, ACT_WLOG_SEND];

pub struct StorageVolState {
    pub notifier: Arc<Notifier>,
    pub stop: AtomicStopState,
    pub sm: StateMachine,
    pub ac: ActionCounters,
}

pub struct StorageNode {
    pub node_id: String,
    pub base_dir: PathBuf,
    pub archive_addr: std::net::SocketAddr,
    pub proxies: Vec<std::net::SocketAddr>,
    /// Caps full-sync throughput; zero means unlimited.
    pub max_lb_per_sec: u64,
    reg: VolumeRegistry<StorageVolState>,
}

impl StorageNode {
    pub fn new(
        node_id: &str,
        base_dir: &Path,
        archive_addr: std::net::SocketAddr,
        proxies: Vec<std::net::SocketAddr>,
    ) -> Arc<Self> {
        let dir = base_dir.to_path_buf();
        Arc::new(StorageNode {
            node_id: node_id.to_string(),
            base_dir: base_dir.to_path_buf(),
            archive_addr,
            proxies,
            max_lb_per_sec: 0,
            reg: VolumeRegistry::new(move |vol| rehydrate(&dir, vol)),
        })
    }

    pub fn vol_state(&self, vol: &str) -> Arc<StorageVolState> {
        self.reg.get(vol)
    }

    fn vol_dir(&self, vol: &str) -> Result<VolumeDir> {
        VolumeDir::new(&self.base_dir, vol)
    }

    pub fn handlers() -> HashMap<&'static str, Handler<StorageNode>> {
        let mut h: HashMap<&'static str, Handler<StorageNode>> = HashMap::new();
        h.insert(msg::CMD_STATUS, c2s_status);
        h.insert(msg::CMD_INIT_VOL, c2s_init_vol);
        h.insert(msg::CMD_CLEAR_VOL, c2s_clear_vol);
        h.insert(msg::CMD_RESET_VOL, c2s_reset_vol);
        h.insert(msg::CMD_START, c2s_start);
        h.insert(msg::CMD_STOP, c2s_stop);
        h.insert(msg::CMD_FULL_BKP, c2s_full_bkp);
        h.insert(msg::CMD_HASH_BKP, c2s_hash_bkp);
        h.insert(msg::CMD_SNAPSHOT, c2s_snapshot);
        h.insert(msg::CMD_KICK, c2s_kick);
        h.insert(msg::CMD_GET, c2s_get);
        h
    }
}

fn rehydrate(base_dir: &Path, vol: &str) -> StorageVolState {
    let notifier = Arc::new(Notifier::new());
    let sm = StateMachine::new(S_CLEAR, STATE_TABLE, Arc::clone(&notifier));
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
    let ac = ActionCounters::new(Arc::clone(&notifier));
    StorageVolState {
        notifier,
        stop: AtomicStopState::new(),
        sm,
        ac,
    }
}

/// The wlog-device's log stream path next to the data device.
fn wlog_stream_path(wdev_path: &Path) -> PathBuf {
    let mut s = wdev_path.as_os_str().to_os_string();
    s.push(".wlog");
    PathBuf::from(s)
}

fn wdev_size_lb(wdev_path: &Path) -> Result<u64> {
    let len = std::fs::metadata(wdev_path)?.len();
    if len == 0 || len % LOGICAL_BLOCK_SIZE as u64 != 0 {
        return Err(WalbakError::InvalidFormat(format!(
            "wlog-device size {len} is not block aligned"
        )));
    }
    Ok(len / LOGICAL_BLOCK_SIZE as u64)
}

/// Reset the written-lsid: drop the consumed log prefix and the cursor.
fn reset_wlog(vd: &VolumeDir) -> Result<()> {
    let log_path = wlog_stream_path(&vd.get_wdev_path()?);
    if log_path.exists() {
        std::fs::File::create(&log_path)?; // truncate
    }
    vd.set_sent_lsid(0)
}


// ── Control commands ───────────────────────────────────────────────────────

fn c2s_status(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
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
            if let Ok(path) = vd.get_wdev_path() {
                lines.push(format!("wdev {}", path.display()));
            }
            if let Ok(uuid) = vd.get_uuid() {
                lines.push(format!("uuid {uuid}"));
            }
            if let Ok(ms) = vd.get_meta_state() {
                lines.push(format!("base {ms}"));
            }
            if let Ok(gid) = vd.get_next_gid() {
                lines.push(format!("nextGid {gid}"));
            }
            if let Ok(lsid) = vd.get_sent_lsid() {
                lines.push(format!("sentLsid {lsid}"));
            }
        }
        reply_ok_with(pkt, &lines)
    })
}

fn c2s_init_vol(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let wdev_path = PathBuf::from(&params[1]);
        if !wdev_path.exists() {
            return Err(WalbakError::BadRequest(format!(
                "wlog-device not found: {}",
                wdev_path.display()
            )));
        }
        let st = node.vol_state(vol);
        let tran = st.sm.transaction(vol, S_CLEAR, ST_INIT_VOL)?;
        let vd = node.vol_dir(vol)?;
        vd.create()?;
        vd.set_wdev_path(&wdev_path)?;
        vd.set_uuid(&Uuid::generate())?;
        vd.set_salt(rand_salt())?;
        vd.set_next_gid(0)?;
        vd.set_sent_lsid(0)?;
        vd.set_state(S_SYNC_READY)?;
        tran.commit(S_SYNC_READY)?;
        info!(vol, wdev = %wdev_path.display(), "volume initialized");
        reply_ok(pkt)
    })
}

fn rand_salt() -> u32 {
    // The uuid generator is the entropy source we already carry.
    let id = Uuid::generate();
    u32::from_le_bytes(id.as_bytes()[0..4].try_into().expect("uuid has 16 bytes"))
}

fn c2s_clear_vol(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        let tran = st.sm.transaction(vol, S_SYNC_READY, ST_CLEAR_VOL)?;
        node.vol_dir(vol)?.remove_all()?;
        tran.commit(S_CLEAR)?;
        node.reg.remove(vol);
        info!(vol, "volume cleared");
        reply_ok(pkt)
    })
}

fn c2s_reset_vol(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let vd = node.vol_dir(vol)?;
        let cur = st.sm.get();
        if cur == S_STOPPED {
            let tran = st.sm.transaction(vol, S_STOPPED, ST_RESET)?;
            reset_wlog(&vd)?;
            vd.set_state(S_SYNC_READY)?;
            tran.commit(S_SYNC_READY)?;
        } else if STUCK_STATES.contains(&cur.as_str()) {
            // Recovery from a failed sync that left the transient.
            reset_wlog(&vd)?;
            vd.set_state(S_SYNC_READY)?;
            st.sm.set(S_SYNC_READY)?;
        } else {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: format!("{S_STOPPED} or a stuck transient"),
            });
        }
        info!(vol, "volume reset");
        reply_ok(pkt)
    })
}

fn c2s_start(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let is_master = match params[1].as_str() {
            "master" => true,
            "slave" => false,
            other => {
                return Err(WalbakError::BadRequest(format!(
                    "start role must be master or slave, got '{other}'"
                )))
            }
        };
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let vd = node.vol_dir(vol)?;
        if is_master {
            let tran = st.sm.transaction(vol, S_STOPPED, ST_START_MASTER)?;
            vd.set_state(S_MASTER)?;
            tran.commit(S_MASTER)?;
        } else {
            let tran = st.sm.transaction(vol, S_SYNC_READY, ST_START_SLAVE)?;
            vd.set_state(S_SLAVE)?;
            tran.commit(S_SLAVE)?;
        }
        reply_ok(pkt)
    })
}

fn c2s_stop(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
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

    // Drained means no transfer is in flight and the state is either a rest
    // state or a stranded transient that only reset-vol can move on.
    st.notifier.wait_until(
        || {
            let cur = st.sm.get();
            st.ac.is_all_zero(&STORAGE_ACTIONS)
                && (REST_STATES.contains(&cur.as_str()) || STUCK_STATES.contains(&cur.as_str()))
        },
        STOP_TIMEOUT,
        "storage stop drain",
    )?;

    let cur = st.sm.get();
    info!(vol, state = %cur, "tasks drained for stop");
    if cur != S_MASTER && cur != S_SLAVE {
        // SyncReady or Stopped already: nothing to transition.
        return Ok(());
    }

    let vd = node.vol_dir(vol)?;
    if cur == S_MASTER {
        let tran = st.sm.transaction(vol, S_MASTER, ST_STOP_MASTER)?;
        vd.set_state(S_STOPPED)?;
        tran.commit(S_STOPPED)?;
    } else {
        let tran = st.sm.transaction(vol, S_SLAVE, ST_STOP_SLAVE)?;
        vd.set_state(S_SYNC_READY)?;
        tran.commit(S_SYNC_READY)?;
    }
    Ok(())
}

/// Full backup: this daemon acts as the dirty-full-sync client toward the
/// archive.
fn c2s_full_bkp(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    let ps = p.ps;
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let bulk_lb: u64 = params[1]
            .parse()
            .map_err(|_| WalbakError::BadRequest(format!("bad bulkLb '{}'", params[1])))?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;

        let tran = st.sm.transaction(vol, S_SYNC_READY, ST_FULL_SYNC)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_FULL_SYNC);
        let vd = node.vol_dir(vol)?;

        let mut run = || -> Result<SyncOutcome> {
            reset_wlog(&vd)?;
            let wdev_path = vd.get_wdev_path()?;
            let size_lb = wdev_size_lb(&wdev_path)?;
            let uuid = Uuid::generate();
            vd.set_uuid(&uuid)?;
            let cur_time = now_unix();

            let ctl = CtlClient::new(node.archive_addr, &node.node_id);
            let sock = ctl.open(msg::PROTO_FULL_SYNC)?;
            let mut apkt = Packet::new(&sock);
            apkt.write(&msg::HOST_STORAGE)?;
            apkt.write(vol)?;
            apkt.write(&uuid)?;
            apkt.write(&size_lb)?;
            apkt.write(&cur_time)?;
            apkt.write(&bulk_lb)?;
            apkt.flush()?;
            read_ok(&mut apkt)?;

            // The archive accepted; acknowledge the controller and stream.
            reply_ok(pkt)?;
            *sent_ok = true;

            let mut reader =
                SeqBdevReader::open(&wdev_path, 0, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IO_SIZE)?;
            let mut stabilizer = ThroughputStabilizer::new(node.max_lb_per_sec);
            let outcome = send_full_image(
                &mut apkt,
                |buf: &mut [u8]| reader.read(buf),
                size_lb,
                bulk_lb,
                Codec::Snappy,
                || st.stop.is_force_stopping() || ps.is_force_shutdown(),
                Some(&mut stabilizer),
            )?;
            if outcome == SyncOutcome::Aborted {
                return Ok(SyncOutcome::Aborted);
            }

            let (gid_b, gid_e) = (0u64, 1u64);
            send_gid_pair(&mut apkt, gid_b, gid_e)?;
            apkt.recv_ack()?;

            vd.set_next_gid(gid_e + 1)?;
            vd.set_meta_state(&MetaState::new(Snap::new(gid_b, gid_e)?, cur_time))?;
            Ok(SyncOutcome::Done)
        };
        match run() {
            Ok(SyncOutcome::Aborted) => {
                warn!(vol, "full backup force-stopped; volume left in transient state");
                tran.leave_transient();
                return Ok(());
            }
            Err(e) => {
                warn!(vol, error = %e, "full backup failed; volume left in transient state");
                tran.leave_transient();
                return Err(e);
            }
            Ok(SyncOutcome::Done) => {}
        }
        vd.set_state(S_STOPPED)?;
        tran.commit(S_STOPPED)?;

        // Full backup flows straight into master mode.
        let tran = st.sm.transaction(vol, S_STOPPED, ST_START_MASTER)?;
        vd.set_state(S_MASTER)?;
        tran.commit(S_MASTER)?;
        info!(vol, "full backup done");
        Ok(())
    })
}

/// Hash backup: compare per-bulk digests with the archive and send only the
/// differing bulks as a diff.
fn c2s_hash_bkp(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    let ps = p.ps;
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let bulk_lb: u64 = params[1]
            .parse()
            .map_err(|_| WalbakError::BadRequest(format!("bad bulkLb '{}'", params[1])))?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;

        let tran = st.sm.transaction(vol, S_SYNC_READY, ST_HASH_SYNC)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_HASH_SYNC);
        let vd = node.vol_dir(vol)?;

        let mut run = || -> Result<SyncOutcome> {
            reset_wlog(&vd)?;
            let wdev_path = vd.get_wdev_path()?;
            let size_lb = wdev_size_lb(&wdev_path)?;
            let uuid = Uuid::generate();
            vd.set_uuid(&uuid)?;
            let cur_time = now_unix();

            let ctl = CtlClient::new(node.archive_addr, &node.node_id);
            let sock = ctl.open(msg::PROTO_HASH_SYNC)?;
            let mut apkt = Packet::new(&sock);
            apkt.write(&msg::HOST_STORAGE)?;
            apkt.write(vol)?;
            apkt.write(&uuid)?;
            apkt.write(&size_lb)?;
            apkt.write(&cur_time)?;
            apkt.write(&bulk_lb)?;
            apkt.flush()?;
            read_ok(&mut apkt)?;
            let _latest: Snap = apkt.read()?;

            reply_ok(pkt)?;
            *sent_ok = true;

            // Receive digests, collect differing bulks.
            let mut reader =
                SeqBdevReader::open(&wdev_path, 0, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IO_SIZE)?;
            let mut buf = vec![0u8; bulk_lb as usize * LOGICAL_BLOCK_SIZE];
            let mut mismatches: Vec<(DiffRecord, Vec<u8>)> = Vec::new();
            let mut addr_lb = 0u64;
            loop {
                if st.stop.is_force_stopping() || ps.is_force_shutdown() {
                    return Ok(SyncOutcome::Aborted);
                }
                match apkt.read_ctrl()? {
                    Ctrl::Next => {}
                    Ctrl::End => break,
                    Ctrl::Error => {
                        return Err(WalbakError::Protocol("peer signalled an error".into()))
                    }
                }
                let digest_chunk = CompressedChunk::recv(&mut apkt)?.uncompress()?;
                let lb = bulk_lb.min(size_lb - addr_lb);
                let size = lb as usize * LOGICAL_BLOCK_SIZE;
                reader.read(&mut buf[..size])?;
                let local = Blake2s256::digest(&buf[..size]);
                if local.as_slice() != digest_chunk.data() {
                    let data = buf[..size].to_vec();
                    mismatches.push((DiffRecord::normal(addr_lb, &data)?, data));
                }
                addr_lb += lb;
            }
            if addr_lb != size_lb {
                return Err(WalbakError::Protocol(format!(
                    "digest stream covered {addr_lb} of {size_lb} blocks"
                )));
            }

            let gid_e = vd.get_next_gid()?.max(1);
            apkt.write(&gid_e)?;
            apkt.flush()?;
            info!(vol, bulks = mismatches.len(), "hash backup sends differing bulks");
            let mut iter = mismatches.into_iter();
            walbak_core::wdiff_net::send_diff(&sock, Codec::Snappy, move || Ok(iter.next()))?;
            apkt.recv_ack()?;

            vd.set_next_gid(gid_e + 2)?;
            vd.set_meta_state(&MetaState::new(Snap::clean(gid_e), cur_time))?;
            Ok(SyncOutcome::Done)
        };
        match run() {
            Ok(SyncOutcome::Aborted) => {
                warn!(vol, "hash backup force-stopped; volume left in transient state");
                tran.leave_transient();
                return Ok(());
            }
            Err(e) => {
                warn!(vol, error = %e, "hash backup failed; volume left in transient state");
                tran.leave_transient();
                return Err(e);
            }
            Ok(SyncOutcome::Done) => {}
        }
        vd.set_state(S_STOPPED)?;
        tran.commit(S_STOPPED)?;
        let tran = st.sm.transaction(vol, S_STOPPED, ST_START_MASTER)?;
        vd.set_state(S_MASTER)?;
        tran.commit(S_MASTER)?;
        info!(vol, "hash backup done");
        Ok(())
    })
}

/// Issue the next snapshot gid. The wlogs up to this point travel with the
/// next wlog-send.
fn c2s_snapshot(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let cur = st.sm.get();
        if cur != S_MASTER {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: S_MASTER.to_string(),
            });
        }
        let vd = node.vol_dir(vol)?;
        // A snapshot point consumes two gids: the clean point itself and the
        // bound of the dirty window behind it.
        let gid = vd.get_next_gid()?;
        vd.set_next_gid(gid + 2)?;
        info!(vol, gid, "snapshot issued");
        reply_ok_with(pkt, &gid)
    })
}

fn c2s_kick(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params: Vec<String> = pkt.read()?;
        let vols = if params.is_empty() {
            walbak_core::volume::list_volumes(&node.base_dir)?
        } else {
            vec![params[0].clone()]
        };
        for vol in vols {
            let st = node.vol_state(&vol);
            match st.sm.get().as_str() {
                S_MASTER => {
                    if let Err(e) = wlog_send(node, &vol) {
                        warn!(vol, error = %e, "wlog send failed; will retry on next kick");
                    }
                }
                S_SLAVE => {
                    if let Err(e) = wlog_remove(node, &vol) {
                        warn!(vol, error = %e, "wlog remove failed");
                    }
                }
                _ => {}
            }
        }
        reply_ok(pkt)
    })
}

/// Forward accumulated wlogs to the proxy as one diff's worth of packs.
fn wlog_send(node: &StorageNode, vol: &str) -> Result<()> {
    let st = node.vol_state(vol);
    verify_not_stopping(&st.stop, vol)?;
    let tran = st.sm.transaction(vol, S_MASTER, ST_WLOG_SEND)?;
    let _act = ActionCounterTransaction::new(&st.ac, ACT_WLOG_SEND);
    let vd = node.vol_dir(vol)?;

    let meta = vd.get_meta_state()?;
    let next_gid = vd.get_next_gid()?;
    // The last issued snapshot gid; snapshots advance next_gid by two.
    let latest_gid = next_gid.saturating_sub(2);
    if next_gid < 2 || latest_gid <= meta.snap.gid1 {
        // No snapshot was issued since the last send.
        tran.commit(S_MASTER)?;
        return Ok(());
    }
    let target = Snap::clean(latest_gid);

    let wdev_path = vd.get_wdev_path()?;
    let size_lb = wdev_size_lb(&wdev_path)?;
    let salt = vd.get_salt()?;
    let uuid = vd.get_uuid()?;
    let sent_lsid = vd.get_sent_lsid()?;
    let now = now_unix();
    let diff = MetaDiff::new(meta.snap, target, now, 0)?;

    // Collect the unsent packs from the device log stream.
    let mut packs: Vec<WlogPack> = Vec::new();
    let log_path = wlog_stream_path(&wdev_path);
    if log_path.exists() {
        let mut reader = WlogStreamReader::new(BufReader::new(File::open(&log_path)?), salt);
        while let Some(pack) = reader.read_pack()? {
            if pack.end_lsid() > sent_lsid {
                packs.push(pack);
            }
        }
    }
    let end_lsid = packs.last().map(|p| p.end_lsid()).unwrap_or(sent_lsid);

    let proxy_addr = node
        .proxies
        .first()
        .ok_or_else(|| WalbakError::BadRequest("no proxy configured".into()))?;
    let ctl = CtlClient::new(*proxy_addr, &node.node_id);
    let sock = ctl.open(msg::PROTO_WLOG_TRANSFER)?;
    let mut ppkt = Packet::new(&sock);
    ppkt.write(&vol)?;
    ppkt.write(&uuid)?;
    ppkt.write(&salt)?;
    ppkt.write(&size_lb)?;
    ppkt.write(&diff)?;
    ppkt.flush()?;
    read_ok(&mut ppkt)?;

    let mut iter = packs.into_iter();
    send_wlog(&sock, Codec::Snappy, salt, move || Ok(iter.next()))?;
    ppkt.recv_ack()?;

    vd.set_sent_lsid(end_lsid)?;
    vd.set_meta_state(&MetaState::new(target, now))?;
    tran.commit(S_MASTER)?;
    info!(vol, gid = latest_gid, end_lsid, "wlog send done");
    Ok(())
}

/// A slave volume only trims its consumed log.
fn wlog_remove(node: &StorageNode, vol: &str) -> Result<()> {
    let st = node.vol_state(vol);
    verify_not_stopping(&st.stop, vol)?;
    let tran = st.sm.transaction(vol, S_SLAVE, ST_WLOG_REMOVE)?;
    let vd = node.vol_dir(vol)?;
    reset_wlog(&vd)?;
    tran.commit(S_SLAVE)?;
    Ok(())
}

fn c2s_get(node: &StorageNode, p: &mut ServerParams<'_>) -> Result<()> {
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
            msg::GET_HOST_TYPE => vec![msg::HOST_STORAGE.to_string()],
            msg::GET_PID => vec![std::process::id().to_string()],
            msg::GET_VOL => walbak_core::volume::list_volumes(&node.base_dir)?,
            msg::GET_STATE => vec![node.vol_state(need_vol()?).sm.get()],
            msg::GET_UUID => vec![node.vol_dir(need_vol()?)?.get_uuid()?.to_string()],
            msg::GET_BASE => vec![node.vol_dir(need_vol()?)?.get_meta_state()?.to_string()],
            msg::GET_VOL_SIZE => {
                let vd = node.vol_dir(need_vol()?)?;
                vec![wdev_size_lb(&vd.get_wdev_path()?)?.to_string()]
            }
            other => {
                return Err(WalbakError::BadRequest(format!("no such target {other}")))
            }
        };
        reply_ok_with(pkt, &lines)
    })
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use walbak_core::stop::Notifier;

    fn fresh_sm(initial: &str) -> StateMachine {
        let sm = StateMachine::new(S_CLEAR, STATE_TABLE, Arc::new(Notifier::new()));
        sm.set(initial).unwrap();
        sm
    }

    #[test]
    fn every_table_edge_commits_and_nothing_else_does() {
        for (from, transient) in STATE_TABLE {
            if !REST_STATES.contains(from) {
                continue;
            }
            let finals: Vec<&str> = STATE_TABLE
                .iter()
                .filter(|(f, _)| f == transient)
                .map(|(_, t)| *t)
                .collect();
            assert!(!finals.is_empty(), "transient {transient} has no exit");
            for final_rest in finals {
                let sm = fresh_sm(from);
                let tran = sm.transaction("v", from, transient).unwrap();
                tran.commit(final_rest).unwrap();
                assert_eq!(sm.get(), *final_rest);
            }
            for other in REST_STATES {
                if other == *from {
                    continue;
                }
                let sm = fresh_sm(other);
                let err = sm.transaction("v", from, transient).unwrap_err();
                assert!(matches!(err, WalbakError::BadState { .. }));
                assert_eq!(sm.get(), other);
            }
        }
    }

    #[test]
    fn full_sync_path_is_well_formed() {
        let sm = fresh_sm(S_SYNC_READY);
        let tran = sm.transaction("v", S_SYNC_READY, ST_FULL_SYNC).unwrap();
        tran.commit(S_STOPPED).unwrap();
        let tran = sm.transaction("v", S_STOPPED, ST_START_MASTER).unwrap();
        tran.commit(S_MASTER).unwrap();
        assert_eq!(sm.get(), S_MASTER);
    }
}
