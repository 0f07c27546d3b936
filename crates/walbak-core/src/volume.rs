//! Per-volume on-disk layout and crash-safe persistence.
//!
//! Every role keeps one directory per volume under its base directory:
//! `state` (rest state name), `base` (MetaState), `uuid`, plus role-specific
//! files. All writes go through a temp file in the same directory and an
//! atomic rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::Gid;
use walbak_types::uuid::Uuid;

use crate::meta::{MetaDiff, MetaState};

pub fn save_obj<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let body = rmp_serde::to_vec(value)?;
    save_bytes(dir, name, &body)
}

pub fn load_obj<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let body = fs::read(dir.join(name))?;
    Ok(rmp_serde::from_slice(&body)?)
}

pub fn save_text(dir: &Path, name: &str, value: &str) -> Result<()> {
    save_bytes(dir, name, value.as_bytes())
}

pub fn load_text(dir: &Path, name: &str) -> Result<String> {
    let body = fs::read_to_string(dir.join(name))?;
    Ok(body.trim_end().to_string())
}

fn save_bytes(dir: &Path, name: &str, body: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.flush()?;
    tmp.persist(dir.join(name))
        .map_err(|e| WalbakError::Io(e.error))?;
    Ok(())
}

const STATE_FILE: &str = "state";
const BASE_FILE: &str = "base";
const UUID_FILE: &str = "uuid";
const SIZE_FILE: &str = "size";
const WDEV_PATH_FILE: &str = "wdev_path";
const NEXT_GID_FILE: &str = "next_gid";
const SENT_LSID_FILE: &str = "sent_lsid";
const SALT_FILE: &str = "salt";
const BASE_IMAGE_FILE: &str = "base.img";
const RESTORED_DIR: &str = "restored";

/// Handle on one volume's directory.
#[derive(Debug, Clone)]
pub struct VolumeDir {
    dir: PathBuf,
    vol: String,
}

impl VolumeDir {
    pub fn new(base_dir: &Path, vol: &str) -> Result<Self> {
        if vol.is_empty() || vol.contains('/') || vol.starts_with('.') {
            return Err(WalbakError::BadRequest(format!("bad volume id '{vol}'")));
        }
        Ok(VolumeDir {
            dir: base_dir.join(vol),
            vol: vol.to_string(),
        })
    }

    pub fn vol(&self) -> &str {
        &self.vol
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the directory tree. Used by `clear-vol`.
    pub fn remove_all(&self) -> Result<()> {
        if self.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    pub fn get_state(&self) -> Result<String> {
        load_text(&self.dir, STATE_FILE)
    }

    pub fn set_state(&self, state: &str) -> Result<()> {
        save_text(&self.dir, STATE_FILE, state)
    }

    pub fn get_uuid(&self) -> Result<Uuid> {
        Uuid::parse(&load_text(&self.dir, UUID_FILE)?)
    }

    pub fn set_uuid(&self, uuid: &Uuid) -> Result<()> {
        save_text(&self.dir, UUID_FILE, &uuid.to_string())
    }

    pub fn get_meta_state(&self) -> Result<MetaState> {
        load_obj(&self.dir, BASE_FILE)
    }

    pub fn set_meta_state(&self, state: &MetaState) -> Result<()> {
        save_obj(&self.dir, BASE_FILE, state)
    }

    pub fn get_size_lb(&self) -> Result<u64> {
        parse_u64(&load_text(&self.dir, SIZE_FILE)?)
    }

    pub fn set_size_lb(&self, size_lb: u64) -> Result<()> {
        save_text(&self.dir, SIZE_FILE, &size_lb.to_string())
    }

    pub fn get_wdev_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(load_text(&self.dir, WDEV_PATH_FILE)?))
    }

    pub fn set_wdev_path(&self, path: &Path) -> Result<()> {
        save_text(&self.dir, WDEV_PATH_FILE, &path.to_string_lossy())
    }

    pub fn get_next_gid(&self) -> Result<Gid> {
        parse_u64(&load_text(&self.dir, NEXT_GID_FILE)?)
    }

    pub fn set_next_gid(&self, gid: Gid) -> Result<()> {
        save_text(&self.dir, NEXT_GID_FILE, &gid.to_string())
    }

    pub fn get_sent_lsid(&self) -> Result<u64> {
        parse_u64(&load_text(&self.dir, SENT_LSID_FILE)?)
    }

    pub fn set_sent_lsid(&self, lsid: u64) -> Result<()> {
        save_text(&self.dir, SENT_LSID_FILE, &lsid.to_string())
    }

    /// The wlog-device's checksum salt.
    pub fn get_salt(&self) -> Result<u32> {
        Ok(parse_u64(&load_text(&self.dir, SALT_FILE)?)? as u32)
    }

    pub fn set_salt(&self, salt: u32) -> Result<()> {
        save_text(&self.dir, SALT_FILE, &salt.to_string())
    }

    /// The archive's thin-provisioned base volume.
    pub fn base_image_path(&self) -> PathBuf {
        self.dir.join(BASE_IMAGE_FILE)
    }

    /// Create (or grow) the base image file. Sparse; never shrinks.
    pub fn ensure_base_image(&self, size_lb: u64) -> Result<()> {
        let path = self.base_image_path();
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let want = size_lb * walbak_types::LOGICAL_BLOCK_SIZE as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        self.set_size_lb(size_lb)?;
        Ok(())
    }

    pub fn restored_dir(&self) -> PathBuf {
        self.dir.join(RESTORED_DIR)
    }

    pub fn restored_path(&self, gid: Gid) -> PathBuf {
        self.restored_dir().join(gid.to_string())
    }

    pub fn list_restored(&self) -> Result<Vec<Gid>> {
        let dir = self.restored_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut gids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Ok(gid) = entry.file_name().to_string_lossy().parse::<u64>() {
                gids.push(gid);
            }
        }
        gids.sort_unstable();
        Ok(gids)
    }

    pub fn wdiff_path(&self, diff: &MetaDiff) -> PathBuf {
        self.dir.join(diff.file_name())
    }

    /// All wdiff files in this directory, sorted by name.
    pub fn list_wdiff_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".wdiff") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Volume ids present under a role's base directory.
pub fn list_volumes(base_dir: &Path) -> Result<Vec<String>> {
    if !base_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut vols = Vec::new();
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            vols.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    vols.sort();
    Ok(vols)
}

fn parse_u64(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| WalbakError::InvalidFormat(format!("bad integer file content '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use walbak_types::gid::Snap;

    #[test]
    fn text_and_obj_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let vd = VolumeDir::new(tmp.path(), "vol0").unwrap();
        vd.create().unwrap();

        vd.set_state("SyncReady").unwrap();
        assert_eq!(vd.get_state().unwrap(), "SyncReady");

        let uuid = Uuid::generate();
        vd.set_uuid(&uuid).unwrap();
        assert_eq!(vd.get_uuid().unwrap(), uuid);

        let ms = MetaState::new(Snap::new(0, 1).unwrap(), 777);
        vd.set_meta_state(&ms).unwrap();
        assert_eq!(vd.get_meta_state().unwrap(), ms);

        vd.set_next_gid(5).unwrap();
        assert_eq!(vd.get_next_gid().unwrap(), 5);
    }

    #[test]
    fn rejects_suspicious_volume_ids() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(VolumeDir::new(tmp.path(), "").is_err());
        assert!(VolumeDir::new(tmp.path(), "a/b").is_err());
        assert!(VolumeDir::new(tmp.path(), "..").is_err());
    }

    #[test]
    fn base_image_grows_but_never_shrinks() {
        let tmp = tempfile::tempdir().unwrap();
        let vd = VolumeDir::new(tmp.path(), "vol0").unwrap();
        vd.create().unwrap();
        vd.ensure_base_image(8).unwrap();
        assert_eq!(
            fs::metadata(vd.base_image_path()).unwrap().len(),
            8 * 512
        );
        vd.ensure_base_image(4).unwrap();
        assert_eq!(
            fs::metadata(vd.base_image_path()).unwrap().len(),
            8 * 512
        );
        vd.ensure_base_image(16).unwrap();
        assert_eq!(
            fs::metadata(vd.base_image_path()).unwrap().len(),
            16 * 512
        );
    }

    #[test]
    fn restored_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let vd = VolumeDir::new(tmp.path(), "vol0").unwrap();
        vd.create().unwrap();
        fs::create_dir_all(vd.restored_dir()).unwrap();
        fs::write(vd.restored_path(4), b"").unwrap();
        fs::write(vd.restored_path(2), b"").unwrap();
        assert_eq!(vd.list_restored().unwrap(), vec![2, 4]);
    }
}
