//! The archive daemon: owns one base image per volume plus the diff catalog,
//! receives full/hash syncs and wdiffs, and serves restore/apply/merge/
//! replicate.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blake2::{Blake2s256, Digest};
use tracing::{info, warn};

use walbak_core::compress::{Codec, CompressedChunk};
use walbak_core::counter::{ActionCounterTransaction, ActionCounters};
use walbak_core::diff::{DiffFileHeader, DiffReader, DiffWriter, VirtualFullScanner};
use walbak_core::fullsync::{
    recv_full_image, recv_gid_pair, send_full_image, SyncOutcome,
};
use walbak_core::meta::{get_relation, MetaDiff, MetaDiffManager, MetaState, Relation};
use walbak_core::registry::VolumeRegistry;
use walbak_core::state_machine::StateMachine;
use walbak_core::stop::{verify_not_stopping, AtomicStopState, Notifier, Stopper};
use walbak_core::volume::VolumeDir;
use walbak_core::wdiff_net::{recv_diff, send_diff};
use walbak_proto::msg;
use walbak_proto::packet::Packet;
use walbak_proto::stream::Ctrl;
use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::{Gid, Snap};
use walbak_types::size::parse_size;
use walbak_types::uuid::Uuid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::ctl::{read_ok, CtlClient};
use crate::dispatch::{recv_params, reply_ok, reply_ok_with, with_error_reply, Handler, ServerParams};

pub const A_CLEAR: &str = "Clear";
pub const A_SYNC_READY: &str = "SyncReady";
pub const A_ARCHIVED: &str = "Archived";
pub const A_STOPPED: &str = "Stopped";

const AT_INIT_VOL: &str = "tInitVol";
const AT_CLEAR_VOL: &str = "tClearVol";
const AT_RESET_VOL: &str = "tResetVol";
const AT_FULL_SYNC: &str = "tFullSync";
const AT_HASH_SYNC: &str = "tHashSync";
const AT_WDIFF_RECV: &str = "tWdiffRecv";
const AT_REPL_SYNC: &str = "tReplSync";
const AT_STOP: &str = "tStop";
const AT_START: &str = "tStart";

pub const ACT_MERGE: &str = "Merge";
pub const ACT_APPLY: &str = "Apply";
pub const ACT_RESTORE: &str = "Restore";
pub const ACT_REPL_SYNC: &str = "ReplSync";
/// In-flight data-plane transfer; lets a stop tell a live transient from a
/// stranded one.
pub const ACT_TRANSFER: &str = "Transfer";

const ARCHIVE_ACTIONS: [&str; 4] = [ACT_MERGE, ACT_APPLY, ACT_RESTORE, ACT_REPL_SYNC];
const STOP_DRAIN_ACTIONS: [&str; 5] =
    [ACT_MERGE, ACT_APPLY, ACT_RESTORE, ACT_REPL_SYNC, ACT_TRANSFER];

const STATE_TABLE: &[(&str, &str)] = &[
    (A_CLEAR, AT_INIT_VOL),
    (AT_INIT_VOL, A_SYNC_READY),
    (A_SYNC_READY, AT_CLEAR_VOL),
    (AT_CLEAR_VOL, A_CLEAR),
    (A_SYNC_READY, AT_FULL_SYNC),
    (AT_FULL_SYNC, A_ARCHIVED),
    (A_SYNC_READY, AT_REPL_SYNC),
    (AT_REPL_SYNC, A_ARCHIVED),
    (A_ARCHIVED, AT_HASH_SYNC),
    (AT_HASH_SYNC, A_ARCHIVED),
    (A_ARCHIVED, AT_WDIFF_RECV),
    (AT_WDIFF_RECV, A_ARCHIVED),
    (A_ARCHIVED, AT_REPL_SYNC),
    (A_ARCHIVED, AT_STOP),
    (AT_STOP, A_STOPPED),
    (A_STOPPED, AT_CLEAR_VOL),
    (A_STOPPED, AT_START),
    (AT_START, A_ARCHIVED),
    (A_STOPPED, AT_RESET_VOL),
    (AT_RESET_VOL, A_SYNC_READY),
];

const REST_STATES: [&str; 4] = [A_CLEAR, A_SYNC_READY, A_ARCHIVED, A_STOPPED];

/// Transients a failed transfer can strand a volume in; `reset-vol` recovers.
const STUCK_STATES: [&str; 4] = [AT_FULL_SYNC, AT_HASH_SYNC, AT_WDIFF_RECV, AT_REPL_SYNC];

const STOP_TIMEOUT: Duration = Duration::from_secs(600);
const REPL_BULK_LB: u64 = 64;

pub struct ArchiveVolState {
    pub notifier: Arc<Notifier>,
    pub stop: AtomicStopState,
    pub sm: StateMachine,
    pub ac: ActionCounters,
    pub diff_mgr: Mutex<MetaDiffManager>,
}

pub struct ArchiveNode {
    pub node_id: String,
    pub base_dir: PathBuf,
    reg: VolumeRegistry<ArchiveVolState>,
}

impl ArchiveNode {
    pub fn new(node_id: &str, base_dir: &Path) -> Arc<Self> {
        let dir = base_dir.to_path_buf();
        Arc::new(ArchiveNode {
            node_id: node_id.to_string(),
            base_dir: base_dir.to_path_buf(),
            reg: VolumeRegistry::new(move |vol| rehydrate(&dir, vol)),
        })
    }

    pub fn vol_state(&self, vol: &str) -> Arc<ArchiveVolState> {
        self.reg.get(vol)
    }

    fn vol_dir(&self, vol: &str) -> Result<VolumeDir> {
        VolumeDir::new(&self.base_dir, vol)
    }

    pub fn handlers() -> HashMap<&'static str, Handler<ArchiveNode>> {
        let mut h: HashMap<&'static str, Handler<ArchiveNode>> = HashMap::new();
        h.insert(msg::CMD_STATUS, c2a_status);
        h.insert(msg::CMD_INIT_VOL, c2a_init_vol);
        h.insert(msg::CMD_CLEAR_VOL, c2a_clear_vol);
        h.insert(msg::CMD_RESET_VOL, c2a_reset_vol);
        h.insert(msg::CMD_START, c2a_start);
        h.insert(msg::CMD_STOP, c2a_stop);
        h.insert(msg::CMD_RESTORE, c2a_restore);
        h.insert(msg::CMD_DEL_RESTORED, c2a_del_restored);
        h.insert(msg::CMD_APPLY, c2a_apply);
        h.insert(msg::CMD_MERGE, c2a_merge);
        h.insert(msg::CMD_RESIZE, c2a_resize);
        h.insert(msg::CMD_REPLICATE, c2a_replicate);
        h.insert(msg::CMD_GET, c2a_get);
        h.insert(msg::PROTO_FULL_SYNC, x2a_dirty_full_sync);
        h.insert(msg::PROTO_HASH_SYNC, x2a_dirty_hash_sync);
        h.insert(msg::PROTO_WDIFF_TRANSFER, x2a_wdiff_transfer);
        h.insert(msg::PROTO_REPL_SYNC, x2a_repl_sync);
        h
    }
}

fn rehydrate(base_dir: &Path, vol: &str) -> ArchiveVolState {
    let notifier = Arc::new(Notifier::new());
    let sm = StateMachine::new(A_CLEAR, STATE_TABLE, Arc::clone(&notifier));
    let ac = ActionCounters::new(Arc::clone(&notifier));
    let mut mgr = MetaDiffManager::new();
    match VolumeDir::new(base_dir, vol) {
        Ok(vd) if vd.exists() => {
            match vd.get_state() {
                Ok(state) => {
                    if let Err(e) = sm.set(&state) {
                        warn!(vol, error = %e, "ignoring bad persisted state");
                    }
                }
                Err(e) => warn!(vol, error = %e, "no persisted state"),
            }
            match reload_diffs(&vd) {
                Ok(m) => mgr = m,
                Err(e) => warn!(vol, error = %e, "diff catalog reload failed"),
            }
        }
        _ => {}
    }
    ArchiveVolState {
        notifier,
        stop: AtomicStopState::new(),
        sm,
        ac,
        diff_mgr: Mutex::new(mgr),
    }
}

/// Rebuild the catalog by scanning the volume directory's wdiff headers.
pub fn reload_diffs(vd: &VolumeDir) -> Result<MetaDiffManager> {
    let mut mgr = MetaDiffManager::new();
    for path in vd.list_wdiff_files()? {
        let size_b = std::fs::metadata(&path)?.len();
        let reader = DiffReader::new(BufReader::new(File::open(&path)?), size_b)?;
        mgr.add(reader.header().diff);
    }
    Ok(mgr)
}

fn verify_no_archive_action(ac: &ActionCounters, vol: &str) -> Result<()> {
    if !ac.is_all_zero(&ARCHIVE_ACTIONS) {
        return Err(WalbakError::BadRequest(format!(
            "volume '{vol}' has running actions: {:?}",
            ac.non_zero()
        )));
    }
    Ok(())
}


// ── Control commands ───────────────────────────────────────────────────────

fn c2a_status(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
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
            if let Ok(uuid) = vd.get_uuid() {
                lines.push(format!("uuid {uuid}"));
            }
            if let Ok(ms) = vd.get_meta_state() {
                let mgr = st.diff_mgr.lock().unwrap();
                lines.push(format!("base {ms}"));
                lines.push(format!("latest {}", mgr.latest(&ms)));
                lines.push(format!("numDiff {}", mgr.len()));
            }
            for (name, count) in st.ac.non_zero() {
                lines.push(format!("action {name} {count}"));
            }
        }
        reply_ok_with(pkt, &lines)
    })
}

fn c2a_init_vol(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_no_archive_action(&st.ac, vol)?;
        let tran = st.sm.transaction(vol, A_CLEAR, AT_INIT_VOL)?;
        let vd = node.vol_dir(vol)?;
        vd.create()?;
        vd.set_state(A_SYNC_READY)?;
        tran.commit(A_SYNC_READY)?;
        info!(vol, "volume initialized");
        reply_ok(pkt)
    })
}

fn c2a_clear_vol(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_no_archive_action(&st.ac, vol)?;
        let cur = st.sm.get();
        if cur != A_SYNC_READY && cur != A_STOPPED {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: format!("{A_SYNC_READY} or {A_STOPPED}"),
            });
        }
        let tran = st.sm.transaction(vol, &cur, AT_CLEAR_VOL)?;
        node.vol_dir(vol)?.remove_all()?;
        st.diff_mgr.lock().unwrap().clear();
        tran.commit(A_CLEAR)?;
        node.reg.remove(vol);
        info!(vol, "volume cleared");
        reply_ok(pkt)
    })
}

fn c2a_reset_vol(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        verify_no_archive_action(&st.ac, vol)?;
        let vd = node.vol_dir(vol)?;
        let cur = st.sm.get();
        if cur == A_STOPPED {
            let tran = st.sm.transaction(vol, A_STOPPED, AT_RESET_VOL)?;
            reset_vol_data(&vd, &st)?;
            tran.commit(A_SYNC_READY)?;
        } else if STUCK_STATES.contains(&cur.as_str()) {
            // Recovery from a failed transfer that left the transient.
            reset_vol_data(&vd, &st)?;
            st.sm.set(A_SYNC_READY)?;
        } else {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: format!("{A_STOPPED} or a stuck transient"),
            });
        }
        info!(vol, "volume reset");
        reply_ok(pkt)
    })
}

fn reset_vol_data(vd: &VolumeDir, st: &ArchiveVolState) -> Result<()> {
    for path in vd.list_wdiff_files()? {
        std::fs::remove_file(path)?;
    }
    let base = vd.base_image_path();
    if base.exists() {
        std::fs::remove_file(base)?;
    }
    st.diff_mgr.lock().unwrap().clear();
    vd.set_state(A_SYNC_READY)?;
    Ok(())
}

fn c2a_start(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 1)?;
        let vol = &params[0];
        let st = node.vol_state(vol);
        verify_no_archive_action(&st.ac, vol)?;
        let tran = st.sm.transaction(vol, A_STOPPED, AT_START)?;
        let vd = node.vol_dir(vol)?;
        let disk_state = vd.get_state()?;
        if disk_state != A_STOPPED {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: disk_state,
                expected: A_STOPPED.to_string(),
            });
        }
        vd.set_state(A_ARCHIVED)?;
        tran.commit(A_ARCHIVED)?;
        reply_ok(pkt)
    })
}

fn c2a_stop(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    let params = recv_params(&mut pkt, 2)?;
    let vol = &params[0];
    let is_force = params[1] != "0";
    let st = node.vol_state(vol);

    // Accept first: the stop completes asynchronously from the
    // controller's point of view.
    reply_ok(&mut pkt)?;

    let stopper = Stopper::new(&st.stop, is_force);
    if !stopper.is_success() {
        return Ok(());
    }

    // Stuck transients count as drained: their transfer has terminated and
    // only reset-vol can move them on.
    st.notifier.wait_until(
        || {
            let cur = st.sm.get();
            st.ac.is_all_zero(&STOP_DRAIN_ACTIONS)
                && (REST_STATES.contains(&cur.as_str()) || STUCK_STATES.contains(&cur.as_str()))
        },
        STOP_TIMEOUT,
        "archive stop drain",
    )?;

    let cur = st.sm.get();
    info!(vol, state = %cur, "tasks drained for stop");
    if cur != A_ARCHIVED {
        return Ok(());
    }
    let tran = st.sm.transaction(vol, A_ARCHIVED, AT_STOP)?;
    let vd = node.vol_dir(vol)?;
    vd.set_state(A_STOPPED)?;
    tran.commit(A_STOPPED)?;
    Ok(())
}

fn c2a_restore(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let gid: Gid = parse_gid(&params[1])?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let cur = st.sm.get();
        if ![A_ARCHIVED, AT_HASH_SYNC, AT_WDIFF_RECV].contains(&cur.as_str()) {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: A_ARCHIVED.to_string(),
            });
        }
        let _act = ActionCounterTransaction::new(&st.ac, ACT_RESTORE);

        let vd = node.vol_dir(vol)?;
        let meta = vd.get_meta_state()?;
        let chain = st.diff_mgr.lock().unwrap().diffs_to_apply(&meta, gid);
        let reached = chain.last().map(|d| d.snap_e).unwrap_or(meta.snap);
        if reached != Snap::clean(gid) {
            return Err(WalbakError::BadRequest(format!(
                "gid {gid} is not restorable for '{vol}'"
            )));
        }
        let paths: Vec<PathBuf> = chain.iter().map(|d| vd.wdiff_path(d)).collect();
        let mut scanner = VirtualFullScanner::open(&vd.base_image_path(), &paths)?;

        std::fs::create_dir_all(vd.restored_dir())?;
        let mut tmp = tempfile::NamedTempFile::new_in(vd.restored_dir())?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            scanner.write_all_to(&mut w, 1 << 20)?;
            w.flush()?;
        }
        tmp.persist(vd.restored_path(gid))
            .map_err(|e| WalbakError::Io(e.error))?;
        info!(vol, gid, "restore done");
        reply_ok(pkt)
    })
}

fn c2a_del_restored(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let gid: Gid = parse_gid(&params[1])?;
        let vd = node.vol_dir(vol)?;
        let path = vd.restored_path(gid);
        if !path.exists() {
            return Err(WalbakError::BadRequest(format!(
                "no restored image for gid {gid}"
            )));
        }
        std::fs::remove_file(path)?;
        reply_ok(pkt)
    })
}

fn c2a_apply(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let gid: Gid = parse_gid(&params[1])?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_APPLY);

        let vd = node.vol_dir(vol)?;
        let meta = vd.get_meta_state()?;
        let chain = st.diff_mgr.lock().unwrap().diffs_to_apply(&meta, gid);
        if chain.is_empty() || chain.last().map(|d| d.snap_e) != Some(Snap::clean(gid)) {
            return Err(WalbakError::BadRequest(format!(
                "gid {gid} is not applicable for '{vol}'"
            )));
        }
        let paths: Vec<PathBuf> = chain.iter().map(|d| vd.wdiff_path(d)).collect();
        let mut scanner = VirtualFullScanner::open(&vd.base_image_path(), &paths)?;

        let mut tmp = tempfile::NamedTempFile::new_in(vd.path())?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            scanner.write_all_to(&mut w, 1 << 20)?;
            w.flush()?;
        }
        tmp.persist(vd.base_image_path())
            .map_err(|e| WalbakError::Io(e.error))?;

        let last = chain.last().expect("chain is non-empty");
        vd.set_meta_state(&MetaState::new(Snap::clean(gid), last.timestamp_s))?;
        {
            let mut mgr = st.diff_mgr.lock().unwrap();
            for d in &chain {
                mgr.erase(d);
            }
        }
        for path in paths {
            std::fs::remove_file(path)?;
        }
        info!(vol, gid, applied = chain.len(), "apply done");
        reply_ok(pkt)
    })
}

fn c2a_merge(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 4)?;
        let vol = &params[0];
        let gid_b: Gid = parse_gid(&params[1])?;
        let gid_e: Gid = parse_gid(&params[2])?;
        let max_size_b = parse_size(&params[3])?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_MERGE);

        let vd = node.vol_dir(vol)?;
        let span = st
            .diff_mgr
            .lock()
            .unwrap()
            .select_for_merge(gid_b, gid_e, usize::MAX, max_size_b);
        if span.len() < 2 {
            return Err(WalbakError::BadRequest(format!(
                "nothing to merge in [{gid_b}, {gid_e}]"
            )));
        }

        let mut merger = walbak_core::diff::DiffMerger::new();
        for d in &span {
            merger.add_wdiff(&vd.wdiff_path(d))?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(vd.path())?;
        let mut merged = merger.write_to(BufWriter::new(tmp.as_file_mut()))?;
        let out_path = vd.wdiff_path(&merged);
        tmp.persist(&out_path).map_err(|e| WalbakError::Io(e.error))?;
        merged.size_b = std::fs::metadata(&out_path)?.len();

        {
            let mut mgr = st.diff_mgr.lock().unwrap();
            for d in &span {
                mgr.erase(d);
            }
            mgr.add(merged);
        }
        for d in &span {
            let path = vd.wdiff_path(d);
            if path != out_path {
                std::fs::remove_file(path)?;
            }
        }
        info!(vol, inputs = span.len(), merged = %merged, "merge done");
        reply_ok(pkt)
    })
}

fn c2a_resize(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let new_size_lb = parse_size(&params[1])? / LOGICAL_BLOCK_SIZE as u64;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        verify_no_archive_action(&st.ac, vol)?;
        let vd = node.vol_dir(vol)?;
        let cur_size = vd.get_size_lb()?;
        if new_size_lb < cur_size {
            return Err(WalbakError::BadRequest(format!(
                "cannot shrink volume '{vol}': {new_size_lb} < {cur_size}"
            )));
        }
        vd.ensure_base_image(new_size_lb)?;
        info!(vol, new_size_lb, "resized");
        reply_ok(pkt)
    })
}

fn c2a_get(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
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
            msg::GET_HOST_TYPE => vec![msg::HOST_ARCHIVE.to_string()],
            msg::GET_PID => vec![std::process::id().to_string()],
            msg::GET_VOL => walbak_core::volume::list_volumes(&node.base_dir)?,
            msg::GET_STATE => vec![node.vol_state(need_vol()?).sm.get()],
            msg::GET_UUID => vec![node.vol_dir(need_vol()?)?.get_uuid()?.to_string()],
            msg::GET_BASE => vec![node.vol_dir(need_vol()?)?.get_meta_state()?.to_string()],
            msg::GET_VOL_SIZE => vec![node.vol_dir(need_vol()?)?.get_size_lb()?.to_string()],
            msg::GET_DIFF => {
                let vol = need_vol()?;
                let st = node.vol_state(vol);
                let mgr = st.diff_mgr.lock().unwrap();
                mgr.list().iter().map(|d| d.to_string()).collect()
            }
            msg::GET_RESTORED => {
                let vol = need_vol()?;
                node.vol_dir(vol)?
                    .list_restored()?
                    .iter()
                    .map(|g| g.to_string())
                    .collect()
            }
            msg::GET_RESTORABLE => {
                let vol = need_vol()?;
                let vd = node.vol_dir(vol)?;
                let meta = vd.get_meta_state()?;
                let st = node.vol_state(vol);
                let mgr = st.diff_mgr.lock().unwrap();
                mgr.restorable(&meta).iter().map(|g| g.to_string()).collect()
            }
            other => {
                return Err(WalbakError::BadRequest(format!("no such target {other}")))
            }
        };
        reply_ok_with(pkt, &lines)
    })
}

// ── Data-plane protocols ───────────────────────────────────────────────────

struct SyncParams {
    host_type: String,
    vol: String,
    uuid: Uuid,
    size_lb: u64,
    cur_time: u64,
    bulk_lb: u64,
}

fn read_sync_params(pkt: &mut Packet<&std::net::TcpStream>) -> Result<SyncParams> {
    let host_type: String = pkt.read()?;
    if host_type != msg::HOST_STORAGE && host_type != msg::HOST_ARCHIVE {
        return Err(WalbakError::BadRequest(format!("bad host type '{host_type}'")));
    }
    let vol: String = pkt.read()?;
    if vol.is_empty() {
        return Err(WalbakError::BadRequest("empty volume id".into()));
    }
    let uuid: Uuid = pkt.read()?;
    let size_lb: u64 = pkt.read()?;
    let cur_time: u64 = pkt.read()?;
    let bulk_lb: u64 = pkt.read()?;
    if bulk_lb == 0 {
        return Err(WalbakError::BadRequest("bulkLb is zero".into()));
    }
    Ok(SyncParams {
        host_type,
        vol,
        uuid,
        size_lb,
        cur_time,
        bulk_lb,
    })
}

/// Dirty full sync server. Peer is a storage daemon (or an archive during
/// replication bootstrap).
fn x2a_dirty_full_sync(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    let ps = p.ps;
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let params = read_sync_params(pkt)?;
        let vol = &params.vol;
        let st = node.vol_state(vol);
        verify_no_archive_action(&st.ac, vol)?;
        verify_not_stopping(&st.stop, vol)?;

        let tran = st.sm.transaction(vol, A_SYNC_READY, AT_FULL_SYNC)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_TRANSFER);
        let vd = node.vol_dir(vol)?;
        let disk_state = vd.get_state()?;
        if disk_state != A_SYNC_READY {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: disk_state,
                expected: A_SYNC_READY.to_string(),
            });
        }
        vd.ensure_base_image(params.size_lb)?;
        reply_ok(pkt)?;
        *sent_ok = true;

        let mut run = || -> Result<SyncOutcome> {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(vd.base_image_path())?;
            let mut out = BufWriter::new(file);
            let outcome = recv_full_image(pkt, &mut out, params.size_lb, params.bulk_lb, || {
                st.stop.is_force_stopping() || ps.is_force_shutdown()
            })?;
            if outcome == SyncOutcome::Aborted {
                return Ok(SyncOutcome::Aborted);
            }
            out.into_inner()
                .map_err(|e| WalbakError::Other(format!("flush base image: {e}")))?
                .sync_data()?;

            let (gid_b, gid_e) = recv_gid_pair(pkt)?;
            vd.set_meta_state(&MetaState::new(Snap::new(gid_b, gid_e)?, params.cur_time))?;
            vd.set_uuid(&params.uuid)?;
            vd.set_state(A_ARCHIVED)?;
            Ok(SyncOutcome::Done)
        };
        match run() {
            Ok(SyncOutcome::Aborted) => {
                warn!(vol, "full sync force-stopped; volume left in transient state");
                tran.leave_transient();
                return Ok(());
            }
            Err(e) => {
                warn!(vol, error = %e, "full sync failed; volume left in transient state");
                tran.leave_transient();
                return Err(e);
            }
            Ok(SyncOutcome::Done) => {}
        }
        tran.commit(A_ARCHIVED)?;
        pkt.send_ack()?;
        info!(vol, host = %params.host_type, size_lb = params.size_lb, "dirty full sync done");
        Ok(())
    })
}

/// WDiff transfer server. Peer is a proxy (steady state) or another archive
/// (replication).
fn x2a_wdiff_transfer(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let vol: String = pkt.read()?;
        if vol.is_empty() {
            return Err(WalbakError::BadRequest("empty volume id".into()));
        }
        let client_type: String = pkt.read()?;
        if client_type != msg::HOST_PROXY && client_type != msg::HOST_ARCHIVE {
            return Err(WalbakError::BadRequest(format!(
                "bad client type '{client_type}'"
            )));
        }
        let uuid: Uuid = pkt.read()?;
        let max_io_blocks: u16 = pkt.read()?;
        let size_lb: u64 = pkt.read()?;
        let mut diff: MetaDiff = pkt.read()?;

        let st = node.vol_state(&vol);
        verify_not_stopping(&st.stop, &vol)?;
        let vd = node.vol_dir(&vol)?;

        // Informational rejections: reported as text, connection stays sane.
        if !vd.exists() {
            info!(vol, reason = msg::ARCHIVE_NOT_FOUND, "wdiff rejected");
            *sent_ok = true;
            pkt.write(&msg::ARCHIVE_NOT_FOUND)?;
            return pkt.flush();
        }
        if st.sm.get() == A_STOPPED {
            info!(vol, reason = msg::STOPPED, "wdiff rejected");
            *sent_ok = true;
            pkt.write(&msg::STOPPED)?;
            return pkt.flush();
        }
        if client_type == msg::HOST_PROXY && vd.get_uuid()? != uuid {
            info!(vol, reason = msg::DIFFERENT_UUID, "wdiff rejected");
            *sent_ok = true;
            pkt.write(&msg::DIFFERENT_UUID)?;
            return pkt.flush();
        }
        if vd.get_size_lb()? < size_lb {
            return Err(WalbakError::BadRequest(format!(
                "peer volume is larger than ours: {size_lb}"
            )));
        }
        let meta = vd.get_meta_state()?;
        let latest = st.diff_mgr.lock().unwrap().latest(&meta);
        let rel = get_relation(latest, &diff);
        if rel != Relation::ApplicableDiff {
            info!(vol, relation = rel.message(), head = %latest, diff = %diff, "wdiff rejected");
            *sent_ok = true;
            pkt.write(&rel.message())?;
            return pkt.flush();
        }
        reply_ok(pkt)?;
        *sent_ok = true;

        let tran = st.sm.transaction(&vol, A_ARCHIVED, AT_WDIFF_RECV)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_TRANSFER);
        let tmp = tempfile::NamedTempFile::new_in(vd.path())?;
        let mut writer = DiffWriter::new(BufWriter::new(tmp.as_file()));
        writer.write_header(&DiffFileHeader {
            uuid,
            max_io_blocks,
            diff,
        })?;
        let recv_result = recv_diff(p.sock, |rec, data| {
            if st.stop.is_force_stopping() {
                return Err(WalbakError::Stopping(vol.clone()));
            }
            writer.add_record(rec, data)
        });
        if let Err(e) = recv_result {
            warn!(vol, error = %e, "wdiff receive failed; volume left in transient state");
            tran.leave_transient();
            return Err(e);
        }
        writer.finish()?;
        let path = vd.wdiff_path(&diff);
        tmp.persist(&path).map_err(|e| WalbakError::Io(e.error))?;
        diff.size_b = std::fs::metadata(&path)?.len();
        st.diff_mgr.lock().unwrap().add(diff);
        tran.commit(A_ARCHIVED)?;
        pkt.send_ack()?;
        info!(vol, diff = %diff, "wdiff received");
        Ok(())
    })
}

/// Dirty hash sync server: stream per-bulk digests of the latest virtual
/// image, then land the differing bulks the peer sends back as a diff.
fn x2a_dirty_hash_sync(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let params = read_sync_params(pkt)?;
        let vol = &params.vol;
        let st = node.vol_state(vol);
        verify_no_archive_action(&st.ac, vol)?;
        verify_not_stopping(&st.stop, vol)?;

        let tran = st.sm.transaction(vol, A_ARCHIVED, AT_HASH_SYNC)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_TRANSFER);
        let vd = node.vol_dir(vol)?;
        if vd.get_size_lb()? != params.size_lb {
            return Err(WalbakError::BadRequest(format!(
                "size mismatch: peer {} vs ours {}",
                params.size_lb,
                vd.get_size_lb()?
            )));
        }
        let meta = vd.get_meta_state()?;
        let (latest, chain) = {
            let mgr = st.diff_mgr.lock().unwrap();
            (mgr.latest(&meta), mgr.applicable_list(meta.snap))
        };
        reply_ok(pkt)?;
        *sent_ok = true;
        pkt.write(&latest)?;
        pkt.flush()?;

        let mut run = || -> Result<()> {
            // Digest stream over the latest virtual image.
            let paths: Vec<PathBuf> = chain.iter().map(|d| vd.wdiff_path(d)).collect();
            let mut scanner = VirtualFullScanner::open(&vd.base_image_path(), &paths)?;
            let mut buf = vec![0u8; params.bulk_lb as usize * LOGICAL_BLOCK_SIZE];
            let mut remaining = params.size_lb;
            while remaining > 0 {
                if st.stop.is_force_stopping() {
                    return Err(WalbakError::Stopping(vol.clone()));
                }
                let lb = params.bulk_lb.min(remaining);
                let size = lb as usize * LOGICAL_BLOCK_SIZE;
                scanner.read_exact_buf(&mut buf[..size])?;
                let digest = Blake2s256::digest(&buf[..size]);
                pkt.write_ctrl(Ctrl::Next)?;
                CompressedChunk::plain(digest.to_vec())?.send(pkt)?;
                remaining -= lb;
            }
            pkt.write_ctrl(Ctrl::End)?;
            pkt.flush()?;

            // The peer replies with the end gid and the differing bulks.
            let gid_e: Gid = pkt.read()?;
            let diff = MetaDiff::new(latest, Snap::clean(gid_e), params.cur_time, 0)?;
            let tmp = tempfile::NamedTempFile::new_in(vd.path())?;
            let mut writer = DiffWriter::new(BufWriter::new(tmp.as_file()));
            writer.write_header(&DiffFileHeader {
                uuid: params.uuid,
                max_io_blocks: params.bulk_lb as u16,
                diff,
            })?;
            recv_diff(p.sock, |rec, data| {
                if st.stop.is_force_stopping() {
                    return Err(WalbakError::Stopping(vol.clone()));
                }
                writer.add_record(rec, data)
            })?;
            writer.finish()?;
            let path = vd.wdiff_path(&diff);
            tmp.persist(&path).map_err(|e| WalbakError::Io(e.error))?;
            let mut diff = diff;
            diff.size_b = std::fs::metadata(&path)?.len();
            st.diff_mgr.lock().unwrap().add(diff);
            vd.set_uuid(&params.uuid)?;
            Ok(())
        };
        if let Err(e) = run() {
            warn!(vol, error = %e, "hash sync failed; volume left in transient state");
            tran.leave_transient();
            return Err(e);
        }
        tran.commit(A_ARCHIVED)?;
        pkt.send_ack()?;
        info!(vol, "dirty hash sync done");
        Ok(())
    })
}

/// Replication client: push this archive's volume to another archive.
fn c2a_replicate(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, _| {
        let params = recv_params(pkt, 2)?;
        let vol = &params[0];
        let dst_addr: std::net::SocketAddr = params[1]
            .parse()
            .map_err(|_| WalbakError::BadRequest(format!("bad address '{}'", params[1])))?;
        let st = node.vol_state(vol);
        verify_not_stopping(&st.stop, vol)?;
        let cur = st.sm.get();
        if cur != A_ARCHIVED {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: A_ARCHIVED.to_string(),
            });
        }
        let _act = ActionCounterTransaction::new(&st.ac, ACT_REPL_SYNC);

        let vd = node.vol_dir(vol)?;
        let meta = vd.get_meta_state()?;
        let uuid = vd.get_uuid()?;
        let size_lb = vd.get_size_lb()?;
        let chain = st.diff_mgr.lock().unwrap().applicable_list(meta.snap);

        let ctl = CtlClient::new(dst_addr, &node.node_id);
        let sock = ctl.open(msg::PROTO_REPL_SYNC)?;
        let mut apkt = Packet::new(&sock);
        apkt.write(&msg::HOST_ARCHIVE)?;
        apkt.write(vol)?;
        apkt.write(&uuid)?;
        apkt.write(&size_lb)?;
        apkt.write(&meta)?;
        apkt.write(&REPL_BULK_LB)?;
        apkt.flush()?;
        read_ok(&mut apkt)?;

        // Base image at `meta`, then the applicable chain above it.
        let mut base = File::open(vd.base_image_path())?;
        let outcome = send_full_image(
            &mut apkt,
            |buf: &mut [u8]| {
                base.read_exact(buf)?;
                Ok(())
            },
            size_lb,
            REPL_BULK_LB,
            Codec::Snappy,
            || st.stop.is_force_stopping(),
            None,
        )?;
        if outcome == SyncOutcome::Aborted {
            return Err(WalbakError::Stopping(vol.clone()));
        }

        apkt.write(&(chain.len() as u64))?;
        for d in &chain {
            let path = vd.wdiff_path(d);
            let size_b = std::fs::metadata(&path)?.len();
            let mut reader = DiffReader::new(BufReader::new(File::open(&path)?), size_b)?;
            apkt.write(d)?;
            apkt.write(&reader.header().max_io_blocks)?;
            apkt.flush()?;
            send_diff(&sock, Codec::Snappy, move || reader.read_record())?;
        }
        apkt.recv_ack()?;
        info!(vol, dst = %dst_addr, diffs = chain.len(), "replication done");
        reply_ok(pkt)
    })
}

/// Replication server: receive a volume from a peer archive.
fn x2a_repl_sync(node: &ArchiveNode, p: &mut ServerParams<'_>) -> Result<()> {
    let mut pkt = Packet::new(p.sock);
    with_error_reply(&mut pkt, |pkt, sent_ok| {
        let host_type: String = pkt.read()?;
        if host_type != msg::HOST_ARCHIVE {
            return Err(WalbakError::BadRequest(format!(
                "repl-sync from '{host_type}'"
            )));
        }
        let vol: String = pkt.read()?;
        let uuid: Uuid = pkt.read()?;
        let size_lb: u64 = pkt.read()?;
        let meta: MetaState = pkt.read()?;
        let bulk_lb: u64 = pkt.read()?;

        let st = node.vol_state(&vol);
        verify_no_archive_action(&st.ac, &vol)?;
        verify_not_stopping(&st.stop, &vol)?;
        let cur = st.sm.get();
        if cur != A_SYNC_READY && cur != A_ARCHIVED {
            return Err(WalbakError::BadState {
                vol: vol.clone(),
                current: cur,
                expected: format!("{A_SYNC_READY} or {A_ARCHIVED}"),
            });
        }
        let tran = st.sm.transaction(&vol, &cur, AT_REPL_SYNC)?;
        let _act = ActionCounterTransaction::new(&st.ac, ACT_TRANSFER);
        let vd = node.vol_dir(&vol)?;
        // Replication replaces whatever chain the destination held.
        for path in vd.list_wdiff_files()? {
            std::fs::remove_file(path)?;
        }
        st.diff_mgr.lock().unwrap().clear();
        vd.ensure_base_image(size_lb)?;
        reply_ok(pkt)?;
        *sent_ok = true;

        let mut run = || -> Result<()> {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(vd.base_image_path())?;
            let mut out = BufWriter::new(file);
            let outcome = recv_full_image(pkt, &mut out, size_lb, bulk_lb, || {
                st.stop.is_force_stopping()
            })?;
            if outcome == SyncOutcome::Aborted {
                return Err(WalbakError::Stopping(vol.clone()));
            }
            out.into_inner()
                .map_err(|e| WalbakError::Other(format!("flush base image: {e}")))?
                .sync_data()?;

            let n_diffs: u64 = pkt.read()?;
            for _ in 0..n_diffs {
                let mut diff: MetaDiff = pkt.read()?;
                let max_io_blocks: u16 = pkt.read()?;
                let tmp = tempfile::NamedTempFile::new_in(vd.path())?;
                let mut writer = DiffWriter::new(BufWriter::new(tmp.as_file()));
                writer.write_header(&DiffFileHeader {
                    uuid,
                    max_io_blocks,
                    diff,
                })?;
                recv_diff(p.sock, |rec, data| writer.add_record(rec, data))?;
                writer.finish()?;
                let path = vd.wdiff_path(&diff);
                tmp.persist(&path).map_err(|e| WalbakError::Io(e.error))?;
                diff.size_b = std::fs::metadata(&path)?.len();
                st.diff_mgr.lock().unwrap().add(diff);
            }
            vd.set_meta_state(&meta)?;
            vd.set_uuid(&uuid)?;
            vd.set_state(A_ARCHIVED)?;
            Ok(())
        };
        if let Err(e) = run() {
            warn!(vol, error = %e, "repl-sync failed; volume left in transient state");
            tran.leave_transient();
            return Err(e);
        }
        tran.commit(A_ARCHIVED)?;
        pkt.send_ack()?;
        info!(vol, size_lb, "repl-sync done");
        Ok(())
    })
}

fn parse_gid(s: &str) -> Result<Gid> {
    s.parse()
        .map_err(|_| WalbakError::BadRequest(format!("bad gid '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_sm(initial: &str) -> StateMachine {
        let sm = StateMachine::new(A_CLEAR, STATE_TABLE, Arc::new(Notifier::new()));
        sm.set(initial).unwrap();
        sm
    }

    /// Every (rest, transient) edge commits to each of its rest successors;
    /// starting anywhere else fails with BadState.
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
                assert!(matches!(err, walbak_types::error::WalbakError::BadState { .. }));
                assert_eq!(sm.get(), other);
            }
        }
    }

    /// No committed transition can leave the table's state set.
    #[test]
    fn transitions_stay_inside_the_table() {
        let sm = fresh_sm(A_CLEAR);
        let tran = sm.transaction("v", A_CLEAR, AT_INIT_VOL).unwrap();
        assert!(tran.commit("Nowhere").is_err());
        assert_eq!(sm.get(), A_CLEAR);
    }
}
