//! End-to-end scenarios over in-process storage, proxy and archive daemons
//! on ephemeral localhost ports.

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::RngCore;

use walbak_core::volume::VolumeDir;
use walbak_core::wlog::{write_pack, WlogPackBuilder};
use walbak_proto::net::KeepAliveParams;
use walbak_server::archive::ArchiveNode;
use walbak_server::ctl::CtlClient;
use walbak_server::dispatch::{serve, ServerConfig};
use walbak_server::proxy::ProxyNode;
use walbak_server::storage::StorageNode;

const LBS: usize = 512;

struct Daemon {
    addr: SocketAddr,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Daemon {
    fn ctl(&self) -> CtlClient {
        CtlClient::new(self.addr, "test-ctl")
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.ctl().shutdown(false);
            let _ = handle.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn config(id: &str) -> ServerConfig {
    ServerConfig {
        node_id: id.to_string(),
        keep_alive: KeepAliveParams::default(),
        socket_timeout: Duration::from_secs(30),
    }
}

fn spawn_archive(dir: &Path, id: &str) -> Daemon {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let node = ArchiveNode::new(id, dir);
    let cfg = config(id);
    let handle = std::thread::spawn(move || {
        serve(listener, node, cfg, ArchiveNode::handlers()).unwrap();
    });
    Daemon {
        addr,
        handle: Some(handle),
    }
}

fn spawn_proxy(dir: &Path, id: &str) -> Daemon {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let node = ProxyNode::new(id, dir);
    let cfg = config(id);
    let handle = std::thread::spawn(move || {
        serve(listener, node, cfg, ProxyNode::handlers()).unwrap();
    });
    Daemon {
        addr,
        handle: Some(handle),
    }
}

fn spawn_storage(dir: &Path, id: &str, archive: SocketAddr, proxy: SocketAddr) -> Daemon {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let node = StorageNode::new(id, dir, archive, vec![proxy]);
    let cfg = config(id);
    let handle = std::thread::spawn(move || {
        serve(listener, node, cfg, StorageNode::handlers()).unwrap();
    });
    Daemon {
        addr,
        handle: Some(handle),
    }
}

struct Cluster {
    storage: Daemon,
    proxy: Daemon,
    archive: Daemon,
    storage_dir: PathBuf,
    archive_dir: PathBuf,
    _dirs: tempfile::TempDir,
}

impl Cluster {
    fn start() -> Cluster {
        let dirs = tempfile::tempdir().unwrap();
        let storage_dir = dirs.path().join("storage");
        let proxy_dir = dirs.path().join("proxy");
        let archive_dir = dirs.path().join("archive");
        for d in [&storage_dir, &proxy_dir, &archive_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        let archive = spawn_archive(&archive_dir, "a0");
        let proxy = spawn_proxy(&proxy_dir, "p0");
        let storage = spawn_storage(&storage_dir, "s0", archive.addr, proxy.addr);
        Cluster {
            storage,
            proxy,
            archive,
            storage_dir,
            archive_dir,
            _dirs: dirs,
        }
    }

    fn make_wdev(&self, name: &str, blocks: usize) -> (PathBuf, Vec<u8>) {
        let path = self._dirs.path().join(name);
        let mut content = vec![0u8; blocks * LBS];
        rand::thread_rng().fill_bytes(&mut content);
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    /// Full pipeline setup for one volume: init everywhere, wire the proxy
    /// to the archive, full backup, start the proxy.
    fn bring_up(&self, vol: &str, wdev: &Path, bulk_lb: u64) {
        let s = self.storage.ctl();
        let p = self.proxy.ctl();
        let a = self.archive.ctl();

        s.init_vol(&[vol, &wdev.to_string_lossy()]).unwrap();
        a.init_vol(&[vol]).unwrap();
        p.init_vol(&[vol]).unwrap();
        p.archive_info(&["add", vol, "a0", &self.archive.addr.to_string()])
            .unwrap();
        p.start(&[vol]).unwrap();
        // full-bkp acknowledges once the archive accepted; the data plane
        // finishes in the background.
        s.full_bkp(vol, bulk_lb).unwrap();
        wait_for_state(&s, vol, "Master");
        wait_for_state(&a, vol, "Archived");
    }

    /// Append one wlog pack writing `data` at `offset_lb`, using the
    /// volume's persisted salt, starting at the given lsid.
    fn append_wlog(&self, vol: &str, wdev: &Path, lsid: u64, offset_lb: u64, data: &[u8]) -> u64 {
        let vd = VolumeDir::new(&self.storage_dir, vol).unwrap();
        let salt = vd.get_salt().unwrap();
        let mut b = WlogPackBuilder::new(lsid, salt);
        b.add_write(offset_lb, data.to_vec()).unwrap();
        let pack = b.build();
        let end = pack.end_lsid();
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(wlog_path(wdev))
            .unwrap();
        write_pack(&mut log, &pack, salt).unwrap();
        end
    }

    fn archive_diffs(&self, vol: &str) -> Vec<String> {
        self.archive.ctl().get(&["diff", vol]).unwrap()
    }

    fn wait_for_diffs(&self, vol: &str, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.archive_diffs(vol).len() >= count {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "archive never reached {count} diffs"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn wlog_path(wdev: &Path) -> PathBuf {
    let mut s = wdev.as_os_str().to_os_string();
    s.push(".wlog");
    PathBuf::from(s)
}

/// The stop command acknowledges before the drain completes; poll for the
/// resulting rest state.
fn wait_for_state(ctl: &CtlClient, vol: &str, state: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if ctl.get_state(vol).unwrap() == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "volume '{vol}' never reached '{state}'"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn init_and_clear_lifecycle() {
    let cluster = Cluster::start();
    let s = cluster.storage.ctl();
    let (wdev, _) = cluster.make_wdev("wdev-lc", 64);

    s.init_vol(&["v-lc", &wdev.to_string_lossy()]).unwrap();
    assert_eq!(s.get_state("v-lc").unwrap(), "SyncReady");

    s.clear_vol("v-lc").unwrap();
    assert_eq!(s.get_state("v-lc").unwrap(), "Clear");

    // Clearing again violates the state machine.
    let err = s.clear_vol("v-lc").unwrap_err();
    assert!(err.to_string().contains("bad state"), "{err}");
}

#[test]
fn full_backup_archives_the_device() {
    let cluster = Cluster::start();
    let s = cluster.storage.ctl();
    let a = cluster.archive.ctl();
    // 1 MiB device, bulk 64 blocks.
    let (wdev, content) = cluster.make_wdev("wdev-fb", 2048);

    s.init_vol(&["v-fb", &wdev.to_string_lossy()]).unwrap();
    a.init_vol(&["v-fb"]).unwrap();
    s.full_bkp("v-fb", 64).unwrap();

    wait_for_state(&s, "v-fb", "Master");
    wait_for_state(&a, "v-fb", "Archived");

    let base = a.get(&["base", "v-fb"]).unwrap();
    assert!(base[0].starts_with("|0,1|@"), "base {base:?}");

    let stored =
        std::fs::read(cluster.archive_dir.join("v-fb").join("base.img")).unwrap();
    assert_eq!(stored, content);
}

#[test]
fn snapshot_and_wlog_flow_through_the_proxy() {
    let cluster = Cluster::start();
    let s = cluster.storage.ctl();
    let p = cluster.proxy.ctl();
    let a = cluster.archive.ctl();
    let (wdev, base_content) = cluster.make_wdev("wdev-wl", 2048);
    let vol = "v-wl";

    cluster.bring_up(vol, &wdev, 64);

    let gid = s.snapshot(vol).unwrap();
    assert_eq!(gid, 2);

    let payload = vec![0xA5u8; 2 * LBS];
    cluster.append_wlog(vol, &wdev, 0, 10, &payload);
    s.kick(Some(vol)).unwrap();
    p.kick(Some(vol)).unwrap();
    cluster.wait_for_diffs(vol, 1);

    assert_eq!(a.get_state(vol).unwrap(), "Archived");
    let diff_file = cluster.archive_dir.join(vol).join("0-2.wdiff");
    assert!(diff_file.exists(), "missing {}", diff_file.display());

    // The head moved to the clean snapshot.
    let restorable = a.get(&["restorable", vol]).unwrap();
    assert_eq!(restorable.last().map(String::as_str), Some("2"));

    // Restoring gid 2 yields the base content overlaid by the wlog write.
    a.restore(vol, 2).unwrap();
    let restored =
        std::fs::read(cluster.archive_dir.join(vol).join("restored").join("2")).unwrap();
    let mut expected = base_content;
    expected[10 * LBS..12 * LBS].copy_from_slice(&payload);
    assert_eq!(restored, expected);

    a.del_restored(vol, 2).unwrap();
    assert!(a.get(&["restored", vol]).unwrap().is_empty());
}

/// Drive three snapshot/write/transfer rounds, returning the expected final
/// image.
fn three_rounds(cluster: &Cluster, vol: &str, wdev: &Path, mut expected: Vec<u8>) -> Vec<u8> {
    let s = cluster.storage.ctl();
    let p = cluster.proxy.ctl();
    let mut lsid = 0;
    for round in 0..3u64 {
        let gid = s.snapshot(vol).unwrap();
        assert_eq!(gid, 2 + round * 2);
        let payload = vec![round as u8 + 1; LBS];
        let offset = 100 + round * 7;
        lsid = cluster.append_wlog(vol, wdev, lsid, offset, &payload);
        expected[offset as usize * LBS..(offset as usize + 1) * LBS].copy_from_slice(&payload);
        s.kick(Some(vol)).unwrap();
        p.kick(Some(vol)).unwrap();
        cluster.wait_for_diffs(vol, round as usize + 1);
    }
    expected
}

#[test]
fn merge_compacts_the_chain() {
    let cluster = Cluster::start();
    let a = cluster.archive.ctl();
    let (wdev, base_content) = cluster.make_wdev("wdev-mg", 1024);
    let vol = "v-mg";

    cluster.bring_up(vol, &wdev, 64);
    let expected = three_rounds(&cluster, vol, &wdev, base_content);
    assert_eq!(cluster.archive_diffs(vol).len(), 3);

    a.merge(vol, 0, 6, "1g").unwrap();
    let diffs = cluster.archive_diffs(vol);
    assert_eq!(diffs.len(), 1, "diffs {diffs:?}");
    assert!(cluster.archive_dir.join(vol).join("0-6.wdiff").exists());

    // The merged diff restores to the same image the chain produced.
    a.restore(vol, 6).unwrap();
    let restored =
        std::fs::read(cluster.archive_dir.join(vol).join("restored").join("6")).unwrap();
    assert_eq!(restored, expected);
}

#[test]
fn apply_collapses_a_prefix() {
    let cluster = Cluster::start();
    let a = cluster.archive.ctl();
    let (wdev, base_content) = cluster.make_wdev("wdev-ap", 1024);
    let vol = "v-ap";

    cluster.bring_up(vol, &wdev, 64);
    three_rounds(&cluster, vol, &wdev, base_content);

    a.apply(vol, 4).unwrap();
    let base = a.get(&["base", vol]).unwrap();
    assert!(base[0].starts_with("|4|@"), "base {base:?}");
    let diffs = cluster.archive_diffs(vol);
    assert_eq!(diffs.len(), 1, "diffs {diffs:?}");
    assert!(cluster.archive_dir.join(vol).join("4-6.wdiff").exists());
    assert!(!cluster.archive_dir.join(vol).join("0-2.wdiff").exists());

    // gid 2 is gone; gid 6 still restorable.
    assert!(a.restore(vol, 2).is_err());
    a.restore(vol, 6).unwrap();
}

#[test]
fn stop_and_reset_cycle() {
    let cluster = Cluster::start();
    let s = cluster.storage.ctl();
    let a = cluster.archive.ctl();
    let (wdev, _) = cluster.make_wdev("wdev-st", 512);
    let vol = "v-st";

    s.init_vol(&[vol, &wdev.to_string_lossy()]).unwrap();
    a.init_vol(&[vol]).unwrap();
    s.full_bkp(vol, 64).unwrap();
    wait_for_state(&s, vol, "Master");

    // Graceful stop waits for rest and lands in Stopped.
    s.stop(vol, false).unwrap();
    wait_for_state(&s, vol, "Stopped");

    // Start again, stop again, then reset back to SyncReady.
    s.start(&[vol, "master"]).unwrap();
    assert_eq!(s.get_state(vol).unwrap(), "Master");
    s.stop(vol, false).unwrap();
    wait_for_state(&s, vol, "Stopped");
    s.reset_vol(vol).unwrap();
    assert_eq!(s.get_state(vol).unwrap(), "SyncReady");

    // The archive side can be stopped and cleared from Stopped.
    a.stop(vol, false).unwrap();
    wait_for_state(&a, vol, "Stopped");
    a.clear_vol(vol).unwrap();
    assert_eq!(a.get_state(vol).unwrap(), "Clear");
}

#[test]
fn hash_backup_resyncs_a_drifted_device() {
    let cluster = Cluster::start();
    let s = cluster.storage.ctl();
    let a = cluster.archive.ctl();
    let (wdev, _) = cluster.make_wdev("wdev-hb", 1024);
    let vol = "v-hb";

    s.init_vol(&[vol, &wdev.to_string_lossy()]).unwrap();
    a.init_vol(&[vol]).unwrap();
    s.full_bkp(vol, 64).unwrap();
    wait_for_state(&s, vol, "Master");
    wait_for_state(&a, vol, "Archived");

    // Drift: overwrite a few blocks directly on the device.
    let mut content = std::fs::read(&wdev).unwrap();
    content[300 * LBS..302 * LBS].fill(0xEE);
    std::fs::write(&wdev, &content).unwrap();

    s.stop(vol, false).unwrap();
    wait_for_state(&s, vol, "Stopped");
    s.reset_vol(vol).unwrap();
    s.hash_bkp(vol, 64).unwrap();
    wait_for_state(&s, vol, "Master");
    wait_for_state(&a, vol, "Archived");

    let restorable = a.get(&["restorable", vol]).unwrap();
    let gid: u64 = restorable.last().unwrap().parse().unwrap();
    a.restore(vol, gid).unwrap();
    let restored = std::fs::read(
        cluster
            .archive_dir
            .join(vol)
            .join("restored")
            .join(gid.to_string()),
    )
    .unwrap();
    assert_eq!(restored, content);
}

#[test]
fn replicate_to_a_second_archive() {
    let cluster = Cluster::start();
    let a1 = cluster.archive.ctl();
    let (wdev, base_content) = cluster.make_wdev("wdev-rp", 1024);
    let vol = "v-rp";

    cluster.bring_up(vol, &wdev, 64);
    let expected = three_rounds(&cluster, vol, &wdev, base_content);

    let dir2 = tempfile::tempdir().unwrap();
    let mut archive2 = spawn_archive(dir2.path(), "a1");
    let a2 = archive2.ctl();
    a2.init_vol(&[vol]).unwrap();

    a1.replicate(vol, &archive2.addr.to_string()).unwrap();
    assert_eq!(a2.get_state(vol).unwrap(), "Archived");
    assert_eq!(a2.get(&["diff", vol]).unwrap().len(), 3);

    a2.restore(vol, 6).unwrap();
    let restored = std::fs::read(dir2.path().join(vol).join("restored").join("6")).unwrap();
    assert_eq!(restored, expected);

    archive2.stop();
}

#[test]
fn unknown_volume_reads_as_clear() {
    let cluster = Cluster::start();
    let a = cluster.archive.ctl();
    // An absent volume directory implies the Clear rest state.
    assert_eq!(a.get_state("nope").unwrap(), "Clear");
}
