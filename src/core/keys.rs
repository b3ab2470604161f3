//! Folder key-bundle snapshots.
//!
//! The real key distribution machinery lives in the identity service; a
//! revision only embeds a snapshot of which device keys were current for
//! the folder's writers when it was produced.

use std::collections::BTreeMap;

use super::identity::UserId;
use super::sign::VerifyingKey;

/// Snapshot of per-writer device verifying keys at one key generation.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TlfKeyBundle {
    pub generation: u64,
    pub writer_keys: BTreeMap<UserId, VerifyingKey>,
}

impl TlfKeyBundle {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            writer_keys: BTreeMap::new(),
        }
    }

    /// First-generation bundle carrying the given writer keys.
    pub fn initial(writer_keys: impl IntoIterator<Item = (UserId, VerifyingKey)>) -> Self {
        Self {
            generation: 1,
            writer_keys: writer_keys.into_iter().collect(),
        }
    }

    pub fn key_for(&self, uid: UserId) -> Option<&VerifyingKey> {
        self.writer_keys.get(&uid)
    }
}
