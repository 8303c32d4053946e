//! Filesystem operations, volume statistics, datestamps.
//!
//! The peer speaks AmigaDOS conventions: `Volume:dir/name` paths,
//! datestamps counted in days since 1978-01-01 plus minutes within the
//! day, and protection bits where 0x04 means write-protected. This module
//! maps all of that onto the host filesystem.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use ax_proto::wire::DirEntry;
use sysinfo::Disks;

use crate::config::Config;

/// Protection bit meaning write-protected.
pub const ATTR_WRITE_PROTECT: u32 = 0x04;

/// Seconds between the Unix epoch and 1978-01-01T00:00:00Z.
const AMIGA_EPOCH_UNIX: u64 = 252_460_800;

/// Converts a host timestamp into a wire datestamp: days since
/// 1978-01-01 and minutes within the day. Times before the epoch clamp
/// to zero.
pub fn to_datestamp(t: SystemTime) -> (u32, u32) {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .saturating_sub(AMIGA_EPOCH_UNIX);
    ((secs / 86_400) as u32, ((secs % 86_400) / 60) as u32)
}

/// Converts a wire datestamp back into a host timestamp.
pub fn from_datestamp(days: u32, minutes: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(AMIGA_EPOCH_UNIX + days as u64 * 86_400 + minutes as u64 * 60)
}

fn clamp_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// One exported volume.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub root: PathBuf,
}

/// The set of host directories exported to the peer.
#[derive(Debug, Clone)]
pub struct VolumeTable {
    volumes: Vec<Volume>,
}

impl VolumeTable {
    /// Builds the table, verifying every export is a directory.
    pub fn from_config(config: &Config) -> Result<VolumeTable> {
        let mut volumes = Vec::with_capacity(config.volumes.len());
        for vol in &config.volumes {
            if !vol.path.is_dir() {
                bail!(
                    "volume {} does not point at a directory: {}",
                    vol.name,
                    vol.path.display()
                );
            }
            info!("exporting {}: -> {}", vol.name, vol.path.display());
            volumes.push(Volume {
                name: vol.name.clone(),
                root: vol.path.clone(),
            });
        }
        Ok(VolumeTable { volumes })
    }

    /// Maps a wire path (`Volume:dir/name`) onto the host filesystem.
    ///
    /// Volume names match case-insensitively, as AmigaDOS does. Parent
    /// references are refused so a request cannot escape its volume.
    pub fn resolve(&self, wire: &str) -> Result<PathBuf> {
        let (volume, rest) = wire
            .split_once(':')
            .ok_or_else(|| anyhow!("path {wire:?} has no volume prefix"))?;
        let vol = self
            .volumes
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(volume))
            .ok_or_else(|| anyhow!("unknown volume {volume:?}"))?;
        let mut path = vol.root.clone();
        for part in rest.split('/') {
            if part.is_empty() {
                continue;
            }
            if part == "." || part == ".." {
                bail!("path {wire:?} escapes volume {}", vol.name);
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Resolves the destination of a rename: a bare name lands next to
    /// the source, a full wire path is resolved as usual.
    pub fn resolve_sibling(&self, src: &Path, name: &str) -> Result<PathBuf> {
        if name.contains(':') {
            return self.resolve(name);
        }
        if name.contains('/') || name == "." || name == ".." || name.is_empty() {
            bail!("invalid new name {name:?}");
        }
        let parent = src
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", src.display()))?;
        Ok(parent.join(name))
    }

    /// Encodes the volume list the way a directory listing is encoded:
    /// one entry per volume, name suffixed with `:`, sizes taken from the
    /// disk backing the export.
    pub fn volume_entries(&self) -> Vec<DirEntry> {
        let disks = Disks::new_with_refreshed_list();
        self.volumes
            .iter()
            .map(|vol| {
                let backing = vol.root.canonicalize().unwrap_or_else(|_| vol.root.clone());
                let disk = disks
                    .list()
                    .iter()
                    .filter(|d| backing.starts_with(d.mount_point()))
                    .max_by_key(|d| d.mount_point().as_os_str().len());
                let (size, used) = match disk {
                    Some(d) => (
                        clamp_u32(d.total_space()),
                        clamp_u32(d.total_space().saturating_sub(d.available_space())),
                    ),
                    None => (0, 0),
                };
                let meta = fs::metadata(&vol.root);
                let (date, time) = meta
                    .as_ref()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(to_datestamp)
                    .unwrap_or((0, 0));
                let write_protected = meta.map(|m| m.permissions().readonly()).unwrap_or(false);
                DirEntry {
                    name: format!("{}:", vol.name),
                    comment: String::new(),
                    size,
                    used,
                    attrs: if write_protected {
                        ATTR_WRITE_PROTECT as u16
                    } else {
                        0
                    },
                    date,
                    time,
                    ctime: time,
                    is_dir: false,
                }
            })
            .collect()
    }
}

/// Walks one directory into wire entries. An error on an individual
/// entry stops the walk; whatever accumulated is still returned.
pub fn list_dir(path: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("directory walk stopped: {e}");
                break;
            }
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot examine {:?}: {e}", entry.file_name());
                break;
            }
        };
        let (date, time) = meta.modified().map(to_datestamp).unwrap_or((0, 0));
        let size = clamp_u32(meta.len());
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            comment: String::new(),
            size,
            used: size,
            attrs: if meta.permissions().readonly() {
                ATTR_WRITE_PROTECT as u16
            } else {
                0
            },
            date,
            time,
            ctime: time,
            is_dir: meta.is_dir(),
        });
    }
    Ok(entries)
}

/// Deletes a file or a whole directory tree.
pub fn delete(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies a file or directory tree.
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::metadata(src)?.is_dir() {
        copy_tree(src, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.metadata()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves an entry: a plain rename where possible, copy plus delete when
/// the rename fails (destination on another volume).
pub fn move_entry(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename failed ({e}), falling back to copy + delete");
            copy_entry(src, dst)?;
            delete(src)
        }
    }
}

/// Applies protection bits: 0x04 maps to the host read-only attribute,
/// the remaining bits have no host equivalent.
pub fn set_protection(path: &Path, attrs: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(attrs & ATTR_WRITE_PROTECT != 0);
    fs::set_permissions(path, perms)
}

/// Accepts a file comment. Host filesystems have nowhere to keep it, so
/// it is logged and dropped.
pub fn set_comment(path: &Path, comment: &str) -> io::Result<()> {
    if !comment.is_empty() {
        debug!(
            "no comment storage on this platform, dropping comment for {}: {comment:?}",
            path.display()
        );
    }
    Ok(())
}

/// Stamps a file or directory with a wire datestamp.
pub fn set_file_date(path: &Path, days: u32, minutes: u32) -> io::Result<()> {
    let file = File::open(path)?;
    file.set_modified(from_datestamp(days, minutes))
}
