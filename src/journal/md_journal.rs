//! The per-TLF MD journal state machine.
//!
//! All operations take `&mut self`; the owner serializes access. Layout on
//! disk:
//!
//! ```text
//! <dir>/md_journal/          live log: entry files, window markers, header.json
//! <dir>/md_journal_tmp/      shadow log while a branch conversion is in flight
//! <dir>/md_journal_old/      previous log during the conversion swap
//! ```
//!
//! Branch conversion re-signs every entry into the shadow log and then
//! swaps directories, so observers see either all old merged entries or
//! all new unmerged ones. The header (current branch id) is written into
//! the shadow last and doubles as its completeness marker.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::JournalConfig;
use crate::core::codec::{decode_signed_metadata, encode_signed_metadata};
use crate::core::ctx::Ctx;
use crate::core::identity::{BranchId, MergeStatus, TlfId, UserId};
use crate::core::metadata::{ImmutableRootMetadata, RootMetadata, RootMetadataSigned};
use crate::core::revision::{MdId, MetadataRevision};
use crate::core::sign::{Signer, VerifyingKey};
use crate::server::errors::MdServerError;

use super::ordered_log::DiskLog;
use super::{MdJournalConflictError, MdJournalError, MdJournalResult};

const LIVE_DIR: &str = "md_journal";
const SHADOW_DIR: &str = "md_journal_tmp";
const OLD_DIR: &str = "md_journal_old";
const HEADER_FILE: &str = "header.json";

/// The slice of the server surface `flush_one` needs.
pub trait MdFlushTarget {
    fn put(&self, ctx: &Ctx, rmds: &RootMetadataSigned) -> Result<(), MdServerError>;

    fn get_range(
        &self,
        ctx: &Ctx,
        id: TlfId,
        bid: BranchId,
        merge: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>, MdServerError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalHeader {
    branch_id: BranchId,
}

/// Ordered journal of signed revisions for one TLF on one device.
#[derive(Debug)]
pub struct MdJournal {
    dir: PathBuf,
    max_entry_bytes: usize,
    log: DiskLog,
    branch_id: BranchId,
}

impl MdJournal {
    /// Opens (or creates) the journal under `dir`, recovering from any
    /// interrupted branch-conversion swap.
    pub fn open(dir: &Path, config: &JournalConfig) -> MdJournalResult<Self> {
        fs::create_dir_all(dir).map_err(|source| MdJournalError::Io {
            path: Some(dir.to_path_buf()),
            source,
        })?;
        recover_conversion_swap(dir)?;

        let live = dir.join(LIVE_DIR);
        let log = DiskLog::open(&live, config.max_entry_bytes)?;

        let header_path = live.join(HEADER_FILE);
        let branch_id = match read_header(&header_path)? {
            Some(header) => header.branch_id,
            None => {
                if !log.is_empty() {
                    return Err(MdJournalError::Corrupt {
                        reason: "journal has entries but no header".to_string(),
                    });
                }
                write_header(&header_path, BranchId::NULL)?;
                BranchId::NULL
            }
        };

        let journal = Self {
            dir: dir.to_path_buf(),
            max_entry_bytes: config.max_entry_bytes,
            log,
            branch_id,
        };
        journal.check_branch_consistency()?;
        Ok(journal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn len(&self) -> u64 {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Appends a revision (or replaces the head) and returns its content
    /// id. The record is stamped with the journal's branch id and `uid`
    /// before signing.
    pub fn put(
        &mut self,
        ctx: &Ctx,
        signer: &dyn Signer,
        rmd: &mut RootMetadata,
        uid: UserId,
        verifying_key: VerifyingKey,
    ) -> MdJournalResult<MdId> {
        ctx.check()?;
        let head = self.head_entry()?;

        let status = rmd.merge_status();
        if status == MergeStatus::Unmerged && rmd.branch_id().is_null() {
            // An unmerged put without an explicit branch adopts the
            // journal's branch.
            rmd.set_branch_id(self.branch_id);
        }
        let bid = rmd.branch_id();
        if (status == MergeStatus::Merged) != bid.is_null() {
            return Err(MdJournalError::InconsistentBranch {
                status,
                branch_id: bid,
            });
        }
        if bid != self.branch_id {
            if bid.is_null() {
                return Err(MdJournalConflictError.into());
            }
            return Err(MdJournalError::BranchMismatch {
                expected: self.branch_id,
                actual: bid,
            });
        }

        rmd.set_last_modifier(uid);

        let mut replace_index = None;
        if let Some(head) = &head {
            if rmd.revision() == head.revision() {
                if rmd.merge_status() != head.merge_status() {
                    return Err(MdJournalError::ReplaceStatusMismatch {
                        expected: head.merge_status(),
                        actual: rmd.merge_status(),
                    });
                }
                if rmd.prev_root() != head.prev_root() {
                    return Err(MdJournalError::ReplacePrevRootMismatch {
                        expected: head.prev_root(),
                        actual: rmd.prev_root(),
                    });
                }
                replace_index = self.log.latest_index();
            } else {
                head.md().check_valid_successor(head.md_id(), rmd)?;
            }
        }

        let rmds = sign_metadata(ctx, signer, rmd)?;
        rmds.is_valid_and_signed()?;
        rmds.is_last_modified_by(uid, verifying_key)?;

        let md_id = rmds.md.md_id()?;
        let bytes = encode_signed_metadata(&rmds)?;
        match replace_index {
            Some(index) => self.log.replace(index, &bytes)?,
            None => {
                self.log.append(&bytes)?;
            }
        }
        debug!(
            tlf = %rmd.tlf_id(),
            revision = %rmd.revision(),
            branch = %bid,
            replaced = replace_index.is_some(),
            "journal put"
        );
        Ok(md_id)
    }

    /// Most recent revision, or `None` while the journal is empty.
    pub fn get_head(&self, uid: UserId) -> MdJournalResult<Option<ImmutableRootMetadata>> {
        let Some(head) = self.head_entry()? else {
            return Ok(None);
        };
        self.check_ownership(self.log.latest_index().unwrap_or_default(), &head, uid)?;
        Ok(Some(head))
    }

    /// Revisions in `[start, stop]`, ascending. Empty if no overlap.
    pub fn get_range(
        &self,
        uid: UserId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> MdJournalResult<Vec<ImmutableRootMetadata>> {
        let mut out = Vec::new();
        let (Some(earliest), Some(latest)) = (self.log.earliest_index(), self.log.latest_index())
        else {
            return Ok(out);
        };
        for index in earliest..=latest {
            let entry = self.entry_at(index)?;
            if entry.revision() < start {
                continue;
            }
            if entry.revision() > stop {
                break;
            }
            self.check_ownership(index, &entry, uid)?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Rewrites every entry onto a fresh non-null branch.
    ///
    /// Builds a shadow log, re-signing entry by entry; the journal is
    /// untouched until the shadow is complete and atomically swapped in.
    pub fn convert_to_branch(
        &mut self,
        ctx: &Ctx,
        signer: &dyn Signer,
        uid: UserId,
        verifying_key: VerifyingKey,
    ) -> MdJournalResult<()> {
        ctx.check()?;
        if !self.branch_id.is_null() {
            return Err(MdJournalError::AlreadyConverted);
        }

        let bid = BranchId::mint();
        let shadow_dir = self.dir.join(SHADOW_DIR);
        if shadow_dir.exists() {
            fs::remove_dir_all(&shadow_dir).map_err(|source| MdJournalError::Io {
                path: Some(shadow_dir.clone()),
                source,
            })?;
        }

        let convert = || -> MdJournalResult<DiskLog> {
            let mut shadow = DiskLog::open(&shadow_dir, self.max_entry_bytes)?;
            let mut prev_id: Option<MdId> = None;
            if let (Some(earliest), Some(latest)) =
                (self.log.earliest_index(), self.log.latest_index())
            {
                for index in earliest..=latest {
                    let entry = self.entry_at(index)?;
                    let mut md = entry.rmds().md.clone();
                    md.set_branch_id(bid);
                    md.set_unmerged();
                    if let Some(prev_id) = prev_id {
                        md.set_prev_root(prev_id);
                    }
                    md.set_last_modifier(uid);
                    let rmds = sign_metadata(ctx, signer, &mut md)?;
                    rmds.is_last_modified_by(uid, verifying_key)?;
                    prev_id = Some(rmds.md.md_id()?);
                    shadow.append(&encode_signed_metadata(&rmds)?)?;
                }
            }
            // Header last: its presence marks the shadow complete.
            write_header(&shadow_dir.join(HEADER_FILE), bid)?;
            Ok(shadow)
        };

        match convert() {
            Ok(_) => {}
            Err(err) => {
                let _ = fs::remove_dir_all(&shadow_dir);
                return Err(err);
            }
        }

        self.swap_in_shadow()?;
        self.branch_id = bid;
        info!(branch = %bid, entries = self.log.len(), "journal converted to branch");
        Ok(())
    }

    /// Submits the earliest entry to the server.
    ///
    /// Returns `false` when the journal is empty. A revision conflict on
    /// the master branch forks the journal and returns `true` without
    /// consuming the entry; the caller re-drives. A conflict whose stored
    /// counterpart matches the local entry (a put that "failed" after a
    /// cancellation but actually landed) counts as success.
    pub fn flush_one(
        &mut self,
        ctx: &Ctx,
        signer: &dyn Signer,
        uid: UserId,
        verifying_key: VerifyingKey,
        server: &dyn MdFlushTarget,
    ) -> MdJournalResult<bool> {
        let Some(index) = self.log.earliest_index() else {
            return Ok(false);
        };
        let earliest = self.entry_at(index)?;
        let rmds = earliest.rmds();

        let mut outcome = server.put(ctx, rmds);
        if matches!(outcome, Err(MdServerError::ConflictRevision { .. })) {
            let stored = server.get_range(
                ctx,
                rmds.md.tlf_id(),
                rmds.md.branch_id(),
                rmds.md.merge_status(),
                rmds.md.revision(),
                rmds.md.revision(),
            )?;
            if let [only] = stored.as_slice()
                && only.md.md_id()? == earliest.md_id()
            {
                debug!(revision = %rmds.md.revision(), "flush found entry already on server");
                outcome = Ok(());
            }
        }

        match outcome {
            Ok(()) => {
                self.log.remove_earliest()?;
                debug!(
                    tlf = %rmds.md.tlf_id(),
                    revision = %rmds.md.revision(),
                    remaining = self.log.len(),
                    "journal entry flushed"
                );
                Ok(true)
            }
            Err(MdServerError::ConflictRevision { .. }) if self.branch_id.is_null() => {
                self.convert_to_branch(ctx, signer, uid, verifying_key)?;
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Empties the journal if `bid` names its current (non-null) branch.
    ///
    /// Clearing the master branch is refused; a stale branch id is a
    /// no-op. Idempotent.
    pub fn clear(&mut self, ctx: &Ctx, _uid: UserId, bid: BranchId) -> MdJournalResult<()> {
        ctx.check()?;
        if bid.is_null() {
            return Err(MdJournalError::ClearMaster);
        }
        if bid != self.branch_id {
            return Ok(());
        }
        self.log.clear_all()?;
        write_header(&self.dir.join(LIVE_DIR).join(HEADER_FILE), BranchId::NULL)?;
        self.branch_id = BranchId::NULL;
        info!(branch = %bid, "journal cleared");
        Ok(())
    }

    fn head_entry(&self) -> MdJournalResult<Option<ImmutableRootMetadata>> {
        match self.log.latest_index() {
            Some(index) => Ok(Some(self.entry_at(index)?)),
            None => Ok(None),
        }
    }

    fn entry_at(&self, index: u64) -> MdJournalResult<ImmutableRootMetadata> {
        let bytes = self.log.get(index)?;
        let rmds = decode_signed_metadata(&bytes)?;
        Ok(ImmutableRootMetadata::new(rmds)?)
    }

    fn check_ownership(
        &self,
        index: u64,
        entry: &ImmutableRootMetadata,
        uid: UserId,
    ) -> MdJournalResult<()> {
        let actual = entry.md().last_modifying_user();
        if actual != uid {
            return Err(MdJournalError::ForeignEntry {
                index,
                expected: uid,
                actual,
            });
        }
        Ok(())
    }

    fn check_branch_consistency(&self) -> MdJournalResult<()> {
        if let Some(head) = self.head_entry()?
            && head.branch_id() != self.branch_id
        {
            return Err(MdJournalError::Corrupt {
                reason: format!(
                    "header branch id {} does not match head branch id {}",
                    self.branch_id,
                    head.branch_id()
                ),
            });
        }
        Ok(())
    }

    fn swap_in_shadow(&mut self) -> MdJournalResult<()> {
        let live = self.dir.join(LIVE_DIR);
        let shadow = self.dir.join(SHADOW_DIR);
        let old = self.dir.join(OLD_DIR);

        rename_dir(&live, &old)?;
        rename_dir(&shadow, &live)?;
        let _ = fs::remove_dir_all(&old);
        self.log = DiskLog::open(&live, self.max_entry_bytes)?;
        Ok(())
    }
}

fn sign_metadata(
    ctx: &Ctx,
    signer: &dyn Signer,
    md: &mut RootMetadata,
) -> MdJournalResult<RootMetadataSigned> {
    let writer_sig = signer.sign(ctx, &md.writer_bytes()?)?;
    md.set_writer_sig(writer_sig);
    let sig = signer.sign(ctx, &md.root_bytes()?)?;
    Ok(RootMetadataSigned { md: md.clone(), sig })
}

/// Rolls an interrupted conversion swap forward or back.
///
/// The shadow is complete iff its header exists; the swap commits the
/// moment the shadow is renamed over the live directory.
fn recover_conversion_swap(dir: &Path) -> MdJournalResult<()> {
    let live = dir.join(LIVE_DIR);
    let shadow = dir.join(SHADOW_DIR);
    let old = dir.join(OLD_DIR);

    if live.exists() {
        // Conversion never reached the swap; discard leftovers.
        if shadow.exists() {
            fs::remove_dir_all(&shadow).map_err(|source| MdJournalError::Io {
                path: Some(shadow.clone()),
                source,
            })?;
        }
        if old.exists() {
            fs::remove_dir_all(&old).map_err(|source| MdJournalError::Io {
                path: Some(old.clone()),
                source,
            })?;
        }
        return Ok(());
    }

    if shadow.join(HEADER_FILE).exists() {
        // Swap was interrupted after moving the live log aside; the
        // complete shadow wins.
        rename_dir(&shadow, &live)?;
        if old.exists() {
            fs::remove_dir_all(&old).map_err(|source| MdJournalError::Io {
                path: Some(old),
                source,
            })?;
        }
        return Ok(());
    }

    if old.exists() {
        // Incomplete shadow; restore the previous log.
        rename_dir(&old, &live)?;
        if shadow.exists() {
            fs::remove_dir_all(&shadow).map_err(|source| MdJournalError::Io {
                path: Some(shadow),
                source,
            })?;
        }
    }
    Ok(())
}

fn rename_dir(from: &Path, to: &Path) -> MdJournalResult<()> {
    fs::rename(from, to).map_err(|source| MdJournalError::Io {
        path: Some(to.to_path_buf()),
        source,
    })
}

fn read_header(path: &Path) -> MdJournalResult<Option<JournalHeader>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MdJournalError::Io {
                path: Some(path.to_path_buf()),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| MdJournalError::HeaderCorrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_header(path: &Path, branch_id: BranchId) -> MdJournalResult<()> {
    let header = JournalHeader { branch_id };
    let bytes = serde_json::to_vec(&header).map_err(|source| MdJournalError::HeaderCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(|source| MdJournalError::Io {
        path: Some(tmp.clone()),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| MdJournalError::Io {
        path: Some(path.to_path_buf()),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::config::JournalConfig;
    use crate::core::handle::TlfHandle;
    use crate::core::identity::ID_BYTE_LEN;
    use crate::core::sign::DeviceSigner;

    fn uid(b: u8) -> UserId {
        UserId::from_bytes([b; ID_BYTE_LEN])
    }

    fn tlf_id() -> TlfId {
        let mut bytes = [1u8; ID_BYTE_LEN];
        bytes[ID_BYTE_LEN - 1] = 0x16;
        TlfId::from_bytes(bytes).unwrap()
    }

    fn md_for(revision: u64, prev_root: MdId) -> RootMetadata {
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();
        let mut md = RootMetadata::new(tlf_id(), &handle).unwrap();
        md.set_revision(MetadataRevision::new(revision));
        md.set_prev_root(prev_root);
        md
    }

    #[test]
    fn fresh_journal_is_empty_on_master() {
        let temp = TempDir::new().unwrap();
        let journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
        assert!(journal.is_empty());
        assert!(journal.branch_id().is_null());
        assert!(journal.get_head(uid(1)).unwrap().is_none());
    }

    #[test]
    fn entries_and_branch_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let signer = DeviceSigner::from_seed([3u8; 32]);
        let key = signer.verifying_key();

        {
            let mut journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
            let mut prev = MdId::of_encoded(b"genesis");
            for revision in 5..8 {
                let mut md = md_for(revision, prev);
                prev = journal.put(&ctx, &signer, &mut md, uid(1), key).unwrap();
            }
            journal
                .convert_to_branch(&ctx, &signer, uid(1), key)
                .unwrap();
        }

        let journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
        assert_eq!(journal.len(), 3);
        assert!(!journal.branch_id().is_null());
        let head = journal.get_head(uid(1)).unwrap().unwrap();
        assert_eq!(head.revision(), MetadataRevision::new(7));
        assert_eq!(head.merge_status(), MergeStatus::Unmerged);
    }

    #[test]
    fn put_rejects_foreign_branch_id() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let signer = DeviceSigner::from_seed([3u8; 32]);
        let key = signer.verifying_key();

        let mut journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
        let mut md = md_for(5, MdId::of_encoded(b"genesis"));
        md.set_branch_id(BranchId::from_bytes([7u8; ID_BYTE_LEN]));
        md.set_unmerged();

        let err = journal
            .put(&ctx, &signer, &mut md, uid(1), key)
            .unwrap_err();
        assert!(matches!(err, MdJournalError::BranchMismatch { .. }));
        assert!(journal.is_empty());
    }

    #[test]
    fn drained_branch_id_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let signer = DeviceSigner::from_seed([3u8; 32]);
        let key = signer.verifying_key();

        let bid;
        {
            let mut journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
            let mut md = md_for(5, MdId::of_encoded(b"genesis"));
            journal.put(&ctx, &signer, &mut md, uid(1), key).unwrap();
            journal
                .convert_to_branch(&ctx, &signer, uid(1), key)
                .unwrap();
            bid = journal.branch_id();
            // Drain by hand.
            journal.log.remove_earliest().unwrap();
            assert!(journal.is_empty());
        }

        let journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
        assert!(journal.is_empty());
        assert_eq!(journal.branch_id(), bid);
    }

    #[test]
    fn get_head_rejects_foreign_entries() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let signer = DeviceSigner::from_seed([3u8; 32]);
        let key = signer.verifying_key();

        let mut journal = MdJournal::open(temp.path(), &JournalConfig::default()).unwrap();
        let mut md = md_for(5, MdId::of_encoded(b"genesis"));
        journal.put(&ctx, &signer, &mut md, uid(1), key).unwrap();

        let err = journal.get_head(uid(9)).unwrap_err();
        assert!(matches!(err, MdJournalError::ForeignEntry { .. }));
    }
}
