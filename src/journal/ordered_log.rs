//! Durable dense-index ordered log.
//!
//! One file per entry (`entry-<ordinal>`), each framed with magic + length
//! + crc32c, plus `EARLIEST`/`LATEST` marker files bounding the live
//! window. Every mutation goes through a temp file and an atomic rename
//! followed by a directory fsync, so a crash leaves the log at some prefix
//! of the completed operations, never torn mid-operation.
//!
//! Marker semantics: both markers absent means the log has never held an
//! entry; `EARLIEST == LATEST + 1` means the log was drained. Entry files
//! outside the live window are leftovers from interrupted operations and
//! are swept on open.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use thiserror::Error;

const ENTRY_MAGIC: u32 = 0x544c_4d44; // "TLMD"
const FRAME_HEADER_LEN: usize = 12;
const EARLIEST_MARKER: &str = "EARLIEST";
const LATEST_MARKER: &str = "LATEST";

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("log entry {index} is not live")]
    NotFound { index: u64 },
    #[error("log entry exceeds max bytes {max_bytes} (got {got_bytes})")]
    EntryTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("entry frame magic mismatch: got {got:#x}")]
    FrameMagicMismatch { got: u32 },
    #[error("entry frame truncated")]
    FrameTruncated,
    #[error("entry frame crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    FrameCrcMismatch { expected: u32, got: u32 },
    #[error("log state invalid at {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Append-only log with a sliding earliest pointer.
#[derive(Debug)]
pub struct DiskLog {
    dir: PathBuf,
    max_entry_bytes: usize,
    /// Ordinal of the oldest live entry.
    earliest: u64,
    /// Ordinal the next append will use; `earliest == next` means empty.
    next: u64,
}

impl DiskLog {
    pub fn open(dir: &Path, max_entry_bytes: usize) -> LogResult<Self> {
        reject_symlink(dir)?;
        fs::create_dir_all(dir).map_err(|source| LogError::Io {
            path: Some(dir.to_path_buf()),
            source,
        })?;
        ensure_dir_permissions(dir)?;

        let earliest_marker = read_marker(dir, EARLIEST_MARKER)?;
        let latest_marker = read_marker(dir, LATEST_MARKER)?;
        let (earliest, next) = match (earliest_marker, latest_marker) {
            (None, None) => (0, 0),
            // EARLIEST is written before the first entry commits; on its
            // own it means nothing was ever appended.
            (Some(earliest), None) => (earliest, earliest),
            (Some(earliest), Some(latest)) => {
                if earliest > latest + 1 {
                    return Err(LogError::Corrupt {
                        path: dir.to_path_buf(),
                        reason: format!("earliest {earliest} beyond latest {latest} + 1"),
                    });
                }
                (earliest, latest + 1)
            }
            (None, Some(_)) => {
                return Err(LogError::Corrupt {
                    path: dir.to_path_buf(),
                    reason: "latest marker present without earliest".to_string(),
                });
            }
        };

        let log = Self {
            dir: dir.to_path_buf(),
            max_entry_bytes,
            earliest,
            next,
        };
        log.sweep_stray_entries()?;
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> u64 {
        self.next - self.earliest
    }

    pub fn is_empty(&self) -> bool {
        self.next == self.earliest
    }

    /// Ordinal of the oldest live entry, if any.
    pub fn earliest_index(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.earliest)
    }

    /// Ordinal of the newest live entry, if any.
    pub fn latest_index(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.next - 1)
    }

    /// Durably appends one entry and returns its ordinal.
    pub fn append(&mut self, entry: &[u8]) -> LogResult<u64> {
        let ordinal = self.next;
        if self.earliest == 0 && self.next == 0 {
            // First ever append: establish the window floor first so no
            // crash leaves LATEST without EARLIEST.
            write_marker(&self.dir, EARLIEST_MARKER, 0)?;
        }
        self.write_entry_file(ordinal, entry)?;
        write_marker(&self.dir, LATEST_MARKER, ordinal)?;
        self.next = ordinal + 1;
        Ok(ordinal)
    }

    pub fn get(&self, index: u64) -> LogResult<Vec<u8>> {
        if !self.is_live(index) {
            return Err(LogError::NotFound { index });
        }
        let path = self.entry_path(index);
        let bytes = fs::read(&path).map_err(|source| LogError::Io {
            path: Some(path),
            source,
        })?;
        decode_entry_frame(&bytes, self.max_entry_bytes)
    }

    /// Atomically replaces one live entry in place.
    pub fn replace(&mut self, index: u64, entry: &[u8]) -> LogResult<()> {
        if !self.is_live(index) {
            return Err(LogError::NotFound { index });
        }
        self.write_entry_file(index, entry)
    }

    /// Reclaims the oldest live entry.
    pub fn remove_earliest(&mut self) -> LogResult<()> {
        let Some(index) = self.earliest_index() else {
            return Err(LogError::NotFound { index: self.earliest });
        };
        write_marker(&self.dir, EARLIEST_MARKER, index + 1)?;
        self.earliest = index + 1;
        let path = self.entry_path(index);
        // The marker already excludes the entry; file removal is cleanup.
        let _ = fs::remove_file(path);
        Ok(())
    }

    /// Truncates the log to empty.
    pub fn clear_all(&mut self) -> LogResult<()> {
        remove_marker(&self.dir, LATEST_MARKER)?;
        remove_marker(&self.dir, EARLIEST_MARKER)?;
        self.earliest = 0;
        self.next = 0;
        self.sweep_stray_entries()?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    fn is_live(&self, index: u64) -> bool {
        index >= self.earliest && index < self.next
    }

    fn entry_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("entry-{index:016x}"))
    }

    fn write_entry_file(&self, ordinal: u64, entry: &[u8]) -> LogResult<()> {
        let frame = encode_entry_frame(entry, self.max_entry_bytes)?;
        let final_path = self.entry_path(ordinal);
        let tmp_path = self.dir.join(format!("entry-{ordinal:016x}.tmp"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| LogError::Io {
                path: Some(tmp_path.clone()),
                source,
            })?;
        file.write_all(&frame).map_err(|source| LogError::Io {
            path: Some(tmp_path.clone()),
            source,
        })?;
        file.sync_all().map_err(|source| LogError::Io {
            path: Some(tmp_path.clone()),
            source,
        })?;
        fs::rename(&tmp_path, &final_path).map_err(|source| LogError::Io {
            path: Some(final_path.clone()),
            source,
        })?;
        fsync_dir(&self.dir)
    }

    /// Removes entry files outside the live window.
    fn sweep_stray_entries(&self) -> LogResult<()> {
        let entries = fs::read_dir(&self.dir).map_err(|source| LogError::Io {
            path: Some(self.dir.clone()),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LogError::Io {
                path: Some(self.dir.clone()),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stray = if let Some(hex) = name.strip_prefix("entry-") {
                if let Some(hex) = hex.strip_suffix(".tmp") {
                    u64::from_str_radix(hex, 16).is_ok()
                } else {
                    match u64::from_str_radix(hex, 16) {
                        Ok(ordinal) => !self.is_live(ordinal),
                        Err(_) => false,
                    }
                }
            } else {
                false
            };
            if stray {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

fn encode_entry_frame(entry: &[u8], max_entry_bytes: usize) -> LogResult<Vec<u8>> {
    if entry.len() > max_entry_bytes {
        return Err(LogError::EntryTooLarge {
            max_bytes: max_entry_bytes,
            got_bytes: entry.len(),
        });
    }
    let length = entry.len() as u32;
    let crc = crc32c(entry);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + entry.len());
    buf.extend_from_slice(&ENTRY_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(entry);
    Ok(buf)
}

fn decode_entry_frame(bytes: &[u8], max_entry_bytes: usize) -> LogResult<Vec<u8>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(LogError::FrameTruncated);
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != ENTRY_MAGIC {
        return Err(LogError::FrameMagicMismatch { got: magic });
    }
    let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if length > max_entry_bytes {
        return Err(LogError::EntryTooLarge {
            max_bytes: max_entry_bytes,
            got_bytes: length,
        });
    }
    if bytes.len() != FRAME_HEADER_LEN + length {
        return Err(LogError::FrameTruncated);
    }
    let expected_crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let body = &bytes[FRAME_HEADER_LEN..];
    let actual_crc = crc32c(body);
    if actual_crc != expected_crc {
        return Err(LogError::FrameCrcMismatch {
            expected: expected_crc,
            got: actual_crc,
        });
    }
    Ok(body.to_vec())
}

fn read_marker(dir: &Path, name: &str) -> LogResult<Option<u64>> {
    let path = dir.join(name);
    let mut raw = String::new();
    match File::open(&path) {
        Ok(mut file) => {
            file.read_to_string(&mut raw).map_err(|source| LogError::Io {
                path: Some(path.clone()),
                source,
            })?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LogError::Io {
                path: Some(path),
                source,
            });
        }
    }
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| LogError::Corrupt {
            path,
            reason: format!("marker is not an ordinal: {raw:?}"),
        })
}

fn write_marker(dir: &Path, name: &str, value: u64) -> LogResult<()> {
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!("{name}.tmp"));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|source| LogError::Io {
            path: Some(tmp_path.clone()),
            source,
        })?;
    file.write_all(value.to_string().as_bytes())
        .map_err(|source| LogError::Io {
            path: Some(tmp_path.clone()),
            source,
        })?;
    file.sync_all().map_err(|source| LogError::Io {
        path: Some(tmp_path.clone()),
        source,
    })?;
    fs::rename(&tmp_path, &final_path).map_err(|source| LogError::Io {
        path: Some(final_path),
        source,
    })?;
    fsync_dir(dir)
}

fn remove_marker(dir: &Path, name: &str) -> LogResult<()> {
    let path = dir.join(name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LogError::Io {
            path: Some(path),
            source,
        }),
    }
}

fn fsync_dir(dir: &Path) -> LogResult<()> {
    let file = File::open(dir).map_err(|source| LogError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })?;
    file.sync_all().map_err(|source| LogError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })
}

fn reject_symlink(path: &Path) -> LogResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LogError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LogError::Io {
            path: Some(path.to_path_buf()),
            source,
        }),
    }
}

fn ensure_dir_permissions(path: &Path) -> LogResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|source| {
            LogError::Io {
                path: Some(path.to_path_buf()),
                source,
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX: usize = 1024;

    #[test]
    fn append_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        assert_eq!(log.len(), 0);

        let first = log.append(b"alpha").unwrap();
        let second = log.append(b"beta").unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(first).unwrap(), b"alpha");
        assert_eq!(log.get(second).unwrap(), b"beta");
    }

    #[test]
    fn get_outside_window_fails() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        assert!(matches!(log.get(0), Err(LogError::NotFound { .. })));
        log.append(b"only").unwrap();
        assert!(matches!(log.get(1), Err(LogError::NotFound { .. })));
    }

    #[test]
    fn replace_swaps_exactly_one_entry() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        log.append(b"alpha").unwrap();
        let idx = log.append(b"beta").unwrap();

        log.replace(idx, b"beta2").unwrap();
        assert_eq!(log.get(idx).unwrap(), b"beta2");
        assert_eq!(log.get(idx - 1).unwrap(), b"alpha");
        assert_eq!(log.len(), 2);

        assert!(matches!(
            log.replace(idx + 1, b"nope"),
            Err(LogError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_earliest_advances_window() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        log.append(b"alpha").unwrap();
        log.append(b"beta").unwrap();

        log.remove_earliest().unwrap();
        assert_eq!(log.len(), 1);
        assert!(matches!(log.get(0), Err(LogError::NotFound { .. })));
        assert_eq!(log.get(1).unwrap(), b"beta");

        log.remove_earliest().unwrap();
        assert!(log.is_empty());
        assert!(matches!(
            log.remove_earliest(),
            Err(LogError::NotFound { .. })
        ));

        // Ordinals keep increasing across a drain.
        let idx = log.append(b"gamma").unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let mut log = DiskLog::open(temp.path(), MAX).unwrap();
            log.append(b"alpha").unwrap();
            log.append(b"beta").unwrap();
            log.append(b"gamma").unwrap();
            log.remove_earliest().unwrap();
        }
        let log = DiskLog::open(temp.path(), MAX).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.earliest_index(), Some(1));
        assert_eq!(log.get(1).unwrap(), b"beta");
        assert_eq!(log.get(2).unwrap(), b"gamma");
    }

    #[test]
    fn drained_log_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let mut log = DiskLog::open(temp.path(), MAX).unwrap();
            log.append(b"alpha").unwrap();
            log.remove_earliest().unwrap();
        }
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.append(b"beta").unwrap(), 1);
    }

    #[test]
    fn clear_all_resets() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        log.append(b"alpha").unwrap();
        log.append(b"beta").unwrap();

        log.clear_all().unwrap();
        assert_eq!(log.len(), 0);
        assert_eq!(log.append(b"gamma").unwrap(), 0);
        assert_eq!(log.get(0).unwrap(), b"gamma");
    }

    #[test]
    fn corrupt_entry_fails_crc() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), MAX).unwrap();
        let idx = log.append(b"alpha").unwrap();

        let path = temp.path().join(format!("entry-{idx:016x}"));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            log.get(idx),
            Err(LogError::FrameCrcMismatch { .. })
        ));
    }

    #[test]
    fn oversized_entry_rejected() {
        let temp = TempDir::new().unwrap();
        let mut log = DiskLog::open(temp.path(), 4).unwrap();
        assert!(matches!(
            log.append(b"too large"),
            Err(LogError::EntryTooLarge { .. })
        ));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn stray_entries_swept_on_open() {
        let temp = TempDir::new().unwrap();
        {
            let mut log = DiskLog::open(temp.path(), MAX).unwrap();
            log.append(b"alpha").unwrap();
        }
        // Simulate a crash that left an entry file beyond LATEST.
        let stray = temp.path().join(format!("entry-{:016x}", 7));
        fs::write(&stray, b"junk").unwrap();

        let log = DiskLog::open(temp.path(), MAX).unwrap();
        assert_eq!(log.len(), 1);
        assert!(!stray.exists());
    }
}
