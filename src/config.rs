//! Journal configuration knobs.

use serde::{Deserialize, Serialize};

fn default_max_entry_bytes() -> usize {
    8 * 1024 * 1024
}

/// Tunables for one on-disk journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    /// Upper bound on one encoded journal entry.
    pub max_entry_bytes: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: default_max_entry_bytes(),
        }
    }
}
