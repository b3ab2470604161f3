//! Conflict-file naming.
//!
//! When a fork is resolved, the losing copy of a file is kept under a name
//! carrying the writer, their device, and the date. The clock feeds only
//! this; journal correctness never depends on wall time.

use time::OffsetDateTime;
use time::macros::format_description;

use crate::core::clock::Clock;

/// Renames conflicted files as `"{base}.conflicted ({user}'s {device} copy
/// {date}){ext}"`.
pub struct WriterDeviceDateRenamer<'a> {
    clock: &'a dyn Clock,
}

impl<'a> WriterDeviceDateRenamer<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self { clock }
    }

    pub fn conflict_rename(&self, user: &str, device: &str, original: &str) -> String {
        let device = if device.is_empty() { "unknown" } else { device };
        let (base, ext) = split_extension(original);
        let date = format_date(self.clock.now_ms());
        format!("{base}.conflicted ({user}'s {device} copy {date}){ext}")
    }
}

fn format_date(now_ms: u64) -> String {
    let format = format_description!("[year]-[month]-[day]");
    OffsetDateTime::from_unix_timestamp((now_ms / 1000) as i64)
        .ok()
        .and_then(|t| t.format(&format).ok())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Splits a filename into base name and extension, keeping common
/// multipart extensions (".tar.gz") together.
pub fn split_extension(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    for i in (1..bytes.len()).rev() {
        match bytes[i] {
            b'.' => {
                let mut split = i;
                if split >= 4 && &path[split - 4..split] == ".tar" {
                    split -= 4;
                }
                if split == 0 || bytes[split - 1] == b'/' || bytes[split - 1] == b'\\' {
                    return (path, "");
                }
                return (&path[..split], &path[split..]);
            }
            b'/' | b'\\' | b' ' => return (path, ""),
            _ => {}
        }
    }
    (path, "")
}
