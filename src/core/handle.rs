//! Bare folder handles: who may write and who may read a TLF.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidHandle};
use super::identity::UserId;

/// Writer and reader sets for one top-level folder.
///
/// Public folders are readable by anyone and carry no explicit reader set.
/// Sets are ordered so the canonical encoding is deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfHandle {
    writers: BTreeSet<UserId>,
    readers: BTreeSet<UserId>,
    public: bool,
}

impl TlfHandle {
    pub fn new(
        writers: impl IntoIterator<Item = UserId>,
        readers: impl IntoIterator<Item = UserId>,
        public: bool,
    ) -> Result<Self, CoreError> {
        let handle = Self {
            writers: writers.into_iter().collect(),
            readers: readers.into_iter().collect(),
            public,
        };
        handle.validate()?;
        Ok(handle)
    }

    /// Reassembles a handle from stored parts without validating; callers
    /// run `validate` as part of record validation.
    pub(crate) fn from_parts(
        writers: BTreeSet<UserId>,
        readers: BTreeSet<UserId>,
        public: bool,
    ) -> Self {
        Self {
            writers,
            readers,
            public,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.writers.is_empty() {
            return Err(InvalidHandle {
                reason: "no writers".into(),
            }
            .into());
        }
        if self.public && !self.readers.is_empty() {
            return Err(InvalidHandle {
                reason: "public folder with explicit readers".into(),
            }
            .into());
        }
        if let Some(uid) = self.writers.intersection(&self.readers).next() {
            return Err(InvalidHandle {
                reason: format!("user {uid} is both writer and reader"),
            }
            .into());
        }
        Ok(())
    }

    pub fn writers(&self) -> &BTreeSet<UserId> {
        &self.writers
    }

    pub fn readers(&self) -> &BTreeSet<UserId> {
        &self.readers
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_writer(&self, uid: UserId) -> bool {
        self.writers.contains(&uid)
    }

    pub fn is_reader(&self, uid: UserId) -> bool {
        self.public || self.readers.contains(&uid) || self.is_writer(uid)
    }
}
