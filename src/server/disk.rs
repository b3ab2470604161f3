//! Disk-backed metadata server.
//!
//! Backs each (TLF, branch) with the same ordered-log machinery the
//! journal uses, under:
//!
//! ```text
//! <root>/handles.json                    canonical-handle -> folder id
//! <root>/<tlf>/handle.json               the folder's handle
//! <root>/<tlf>/branches/<branch>/        ordered log of signed revisions
//! ```
//!
//! Intended for the temporary-directory test toggle; update subscriptions
//! are process-local.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam::channel;
use tracing::debug;

use crate::core::codec::{decode_signed_metadata, encode_handle, encode_signed_metadata};
use crate::core::ctx::Ctx;
use crate::core::handle::TlfHandle;
use crate::core::identity::{BranchId, MergeStatus, TlfId, UserId};
use crate::core::metadata::RootMetadataSigned;
use crate::core::revision::{MdId, MetadataRevision};
use crate::journal::ordered_log::DiskLog;

use super::errors::MdServerError;
use super::{
    MdServer, UpdateStream, UpdateWaiter, check_put_against_tail, lookup_branch, notify_waiters,
};

const HANDLES_FILE: &str = "handles.json";
const HANDLE_FILE: &str = "handle.json";
const BRANCHES_DIR: &str = "branches";
const MASTER_BRANCH_DIR: &str = "master";

struct DiskState {
    handles: HashMap<String, TlfId>,
    logs: HashMap<(TlfId, BranchId), DiskLog>,
    waiters: HashMap<TlfId, Vec<UpdateWaiter>>,
}

/// Disk-backed [`MdServer`] bound to one session user.
pub struct MdServerDisk {
    uid: UserId,
    root: PathBuf,
    max_entry_bytes: usize,
    state: Mutex<DiskState>,
}

impl MdServerDisk {
    pub fn open(root: &Path, uid: UserId, max_entry_bytes: usize) -> Result<Self, MdServerError> {
        fs::create_dir_all(root).map_err(|err| server_error("create server root", err))?;
        let handles = match fs::read(root.join(HANDLES_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| server_error("decode handle mapping", err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(server_error("read handle mapping", err)),
        };
        Ok(Self {
            uid,
            root: root.to_path_buf(),
            max_entry_bytes,
            state: Mutex::new(DiskState {
                handles,
                logs: HashMap::new(),
                waiters: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_dir(&self, id: TlfId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn branch_dir(&self, id: TlfId, bid: BranchId) -> PathBuf {
        let branch = if bid.is_null() {
            MASTER_BRANCH_DIR.to_string()
        } else {
            bid.to_string()
        };
        self.folder_dir(id).join(BRANCHES_DIR).join(branch)
    }

    fn load_handle(&self, id: TlfId) -> Result<Option<TlfHandle>, MdServerError> {
        let path = self.folder_dir(id).join(HANDLE_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| server_error("decode folder handle", err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(server_error("read folder handle", err)),
        }
    }

    fn store_folder(&self, state: &mut DiskState, id: TlfId, handle: &TlfHandle)
    -> Result<(), MdServerError> {
        let dir = self.folder_dir(id);
        fs::create_dir_all(&dir).map_err(|err| server_error("create folder dir", err))?;
        let bytes = serde_json::to_vec(handle)
            .map_err(|err| server_error("encode folder handle", err))?;
        fs::write(dir.join(HANDLE_FILE), bytes)
            .map_err(|err| server_error("write folder handle", err))?;

        let key = handle_key(handle)?;
        state.handles.insert(key, id);
        let bytes = serde_json::to_vec(&state.handles)
            .map_err(|err| server_error("encode handle mapping", err))?;
        let path = self.root.join(HANDLES_FILE);
        let tmp = self.root.join(format!("{HANDLES_FILE}.tmp"));
        fs::write(&tmp, &bytes).map_err(|err| server_error("write handle mapping", err))?;
        fs::rename(&tmp, &path).map_err(|err| server_error("commit handle mapping", err))?;
        Ok(())
    }

    fn log_mut<'a>(
        &self,
        state: &'a mut DiskState,
        id: TlfId,
        bid: BranchId,
    ) -> Result<&'a mut DiskLog, MdServerError> {
        if !state.logs.contains_key(&(id, bid)) {
            let log = DiskLog::open(&self.branch_dir(id, bid), self.max_entry_bytes)
                .map_err(|err| server_error("open branch log", err))?;
            state.logs.insert((id, bid), log);
        }
        Ok(state
            .logs
            .get_mut(&(id, bid))
            .expect("log present after insert"))
    }

    fn branch_entries(
        &self,
        state: &mut DiskState,
        id: TlfId,
        bid: BranchId,
    ) -> Result<Vec<RootMetadataSigned>, MdServerError> {
        if !self.branch_dir(id, bid).exists() && !state.logs.contains_key(&(id, bid)) {
            return Ok(Vec::new());
        }
        let log = self.log_mut(state, id, bid)?;
        let mut out = Vec::new();
        if let (Some(earliest), Some(latest)) = (log.earliest_index(), log.latest_index()) {
            for index in earliest..=latest {
                let bytes = log
                    .get(index)
                    .map_err(|err| server_error("read branch log entry", err))?;
                out.push(decode_signed_metadata(&bytes).map_err(|err| {
                    server_error("decode branch log entry", err)
                })?);
            }
        }
        Ok(out)
    }

    fn authorize_reader(&self, id: TlfId) -> Result<TlfHandle, MdServerError> {
        let handle = self
            .load_handle(id)?
            .ok_or_else(|| MdServerError::Unauthorized {
                reason: format!("unknown folder {id}"),
            })?;
        if !handle.is_reader(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} may not read folder {id}", self.uid),
            });
        }
        Ok(handle)
    }
}

impl MdServer for MdServerDisk {
    fn get_for_handle(
        &self,
        ctx: &Ctx,
        handle: &TlfHandle,
        merge: MergeStatus,
    ) -> Result<(TlfId, Option<RootMetadataSigned>), MdServerError> {
        ctx.check()?;
        handle
            .validate()
            .map_err(|err| MdServerError::BadRequest {
                reason: err.to_string(),
            })?;
        if !handle.is_reader(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} is not in the folder handle", self.uid),
            });
        }
        let key = handle_key(handle)?;

        let mut state = self.state.lock().expect("server state lock poisoned");
        let id = match state.handles.get(&key).copied() {
            Some(id) => {
                let stored = self.load_handle(id)?.ok_or_else(|| MdServerError::Server {
                    reason: format!("handle maps to missing folder {id}"),
                })?;
                if stored != *handle {
                    // The folder record no longer matches the mapping;
                    // report the folder the stored handle actually
                    // belongs to.
                    let actual = state.handles.get(&handle_key(&stored)?).copied();
                    return Err(match actual {
                        Some(actual) => MdServerError::ConflictFolderMapping {
                            expected: id,
                            actual,
                        },
                        None => MdServerError::Server {
                            reason: format!(
                                "folder {id} record does not match any handle mapping"
                            ),
                        },
                    });
                }
                id
            }
            None => {
                let id = TlfId::mint(handle.is_public());
                self.store_folder(&mut state, id, handle)?;
                debug!(tlf = %id, "minted folder id for handle");
                id
            }
        };

        let head = match merge {
            MergeStatus::Merged => self
                .branch_entries(&mut state, id, BranchId::NULL)?
                .pop(),
            MergeStatus::Unmerged => None,
        };
        Ok((id, head))
    }

    fn get_for_tlf(
        &self,
        ctx: &Ctx,
        id: TlfId,
        bid: BranchId,
        merge: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>, MdServerError> {
        ctx.check()?;
        self.authorize_reader(id)?;
        let Some(branch) = lookup_branch(bid, merge) else {
            return Ok(None);
        };
        let mut state = self.state.lock().expect("server state lock poisoned");
        Ok(self.branch_entries(&mut state, id, branch)?.pop())
    }

    fn get_range(
        &self,
        ctx: &Ctx,
        id: TlfId,
        bid: BranchId,
        merge: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>, MdServerError> {
        ctx.check()?;
        self.authorize_reader(id)?;
        let Some(branch) = lookup_branch(bid, merge) else {
            return Ok(Vec::new());
        };
        let mut state = self.state.lock().expect("server state lock poisoned");
        Ok(self
            .branch_entries(&mut state, id, branch)?
            .into_iter()
            .filter(|rmds| rmds.md.revision() >= start && rmds.md.revision() <= stop)
            .collect())
    }

    fn put(&self, ctx: &Ctx, rmds: &RootMetadataSigned) -> Result<(), MdServerError> {
        ctx.check()?;
        let handle = rmds.md.handle();
        if !handle.is_writer(self.uid)
            || rmds.md.writer_md().last_modifying_writer() != self.uid
        {
            return Err(MdServerError::WriteAccess);
        }
        rmds.is_valid_and_signed()
            .map_err(|err| MdServerError::BadRequest {
                reason: err.to_string(),
            })?;

        let id = rmds.md.tlf_id();
        let bid = rmds.md.branch_id();

        let mut state = self.state.lock().expect("server state lock poisoned");
        match self.load_handle(id)? {
            Some(stored) => {
                if !stored.is_writer(self.uid) {
                    return Err(MdServerError::WriteAccess);
                }
            }
            None => self.store_folder(&mut state, id, &handle)?,
        }

        let merged = self.branch_entries(&mut state, id, BranchId::NULL)?;
        let entries = if bid.is_null() {
            merged.clone()
        } else {
            self.branch_entries(&mut state, id, bid)?
        };
        let tail = match entries.last() {
            Some(tail) => {
                let tail_id = tail.md.md_id().map_err(|err| MdServerError::Server {
                    reason: err.to_string(),
                })?;
                Some((tail, tail_id))
            }
            None => None,
        };
        check_put_against_tail(rmds, tail, |prev_root| {
            merged_revision_of(&merged, prev_root)
        })?;

        let bytes = encode_signed_metadata(rmds).map_err(|err| MdServerError::BadRequest {
            reason: err.to_string(),
        })?;
        self.log_mut(&mut state, id, bid)?
            .append(&bytes)
            .map_err(|err| server_error("append branch log entry", err))?;
        debug!(
            tlf = %id,
            branch = %bid,
            revision = %rmds.md.revision(),
            "server accepted revision"
        );

        if bid.is_null() {
            let waiters = state.waiters.entry(id).or_default();
            notify_waiters(waiters, rmds.md.revision());
        }
        Ok(())
    }

    fn prune_branch(&self, ctx: &Ctx, id: TlfId, bid: BranchId) -> Result<(), MdServerError> {
        ctx.check()?;
        if bid.is_null() {
            return Err(MdServerError::BadRequest {
                reason: "cannot prune the master branch".to_string(),
            });
        }
        let handle = self
            .load_handle(id)?
            .ok_or_else(|| MdServerError::Unauthorized {
                reason: format!("unknown folder {id}"),
            })?;
        if !handle.is_writer(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} may not prune folder {id}", self.uid),
            });
        }

        let mut state = self.state.lock().expect("server state lock poisoned");
        state.logs.remove(&(id, bid));
        let dir = self.branch_dir(id, bid);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|err| server_error("remove branch dir", err))?;
        }
        debug!(tlf = %id, branch = %bid, "pruned branch");
        Ok(())
    }

    fn register_for_update(
        &self,
        ctx: &Ctx,
        id: TlfId,
        last_seen: MetadataRevision,
    ) -> Result<UpdateStream, MdServerError> {
        ctx.check()?;
        self.authorize_reader(id)?;

        let mut state = self.state.lock().expect("server state lock poisoned");
        let head = self
            .branch_entries(&mut state, id, BranchId::NULL)?
            .pop()
            .map(|rmds| rmds.md.revision());

        let (sender, receiver) = channel::bounded(1);
        if let Some(head) = head
            && head > last_seen
        {
            let _ = sender.send(head);
        } else {
            state
                .waiters
                .entry(id)
                .or_default()
                .push(UpdateWaiter { last_seen, sender });
        }
        Ok(receiver)
    }
}

fn merged_revision_of(merged: &[RootMetadataSigned], md_id: MdId) -> Option<MetadataRevision> {
    merged
        .iter()
        .find(|rmds| rmds.md.md_id().is_ok_and(|id| id == md_id))
        .map(|rmds| rmds.md.revision())
}

fn handle_key(handle: &TlfHandle) -> Result<String, MdServerError> {
    let bytes = encode_handle(handle).map_err(|err| MdServerError::BadRequest {
        reason: err.to_string(),
    })?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn server_error(action: &str, err: impl std::fmt::Display) -> MdServerError {
    MdServerError::Server {
        reason: format!("{action}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::core::identity::ID_BYTE_LEN;
    use crate::core::metadata::RootMetadata;
    use crate::core::sign::{DeviceSigner, Signer};

    fn uid(b: u8) -> UserId {
        UserId::from_bytes([b; ID_BYTE_LEN])
    }

    fn signed_md(
        signer: &DeviceSigner,
        id: TlfId,
        handle: &TlfHandle,
        revision: u64,
        prev_root: MdId,
    ) -> RootMetadataSigned {
        let ctx = Ctx::background();
        let mut md = RootMetadata::new(id, handle).unwrap();
        md.set_revision(MetadataRevision::new(revision));
        md.set_prev_root(prev_root);
        let writer_sig = signer.sign(&ctx, &md.writer_bytes().unwrap()).unwrap();
        md.set_writer_sig(writer_sig);
        let sig = signer.sign(&ctx, &md.root_bytes().unwrap()).unwrap();
        RootMetadataSigned { md, sig }
    }

    #[test]
    fn history_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let signer = DeviceSigner::from_seed([1u8; 32]);
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();

        let id;
        let mut prev = MdId::ZERO;
        {
            let server = MdServerDisk::open(temp.path(), uid(1), 1 << 20).unwrap();
            let (minted, _) = server
                .get_for_handle(&ctx, &handle, MergeStatus::Merged)
                .unwrap();
            id = minted;
            for revision in 1..=3 {
                let rmds = signed_md(&signer, id, &handle, revision, prev);
                server.put(&ctx, &rmds).unwrap();
                prev = rmds.md.md_id().unwrap();
            }
        }

        let server = MdServerDisk::open(temp.path(), uid(1), 1 << 20).unwrap();
        let (same_id, head) = server
            .get_for_handle(&ctx, &handle, MergeStatus::Merged)
            .unwrap();
        assert_eq!(same_id, id);
        assert_eq!(
            head.unwrap().md.revision(),
            MetadataRevision::new(3)
        );
        let range = server
            .get_range(
                &ctx,
                id,
                BranchId::NULL,
                MergeStatus::Merged,
                MetadataRevision::new(1),
                MetadataRevision::new(10),
            )
            .unwrap();
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn diverged_folder_record_reports_mapping_conflict() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let server = MdServerDisk::open(temp.path(), uid(1), 1 << 20).unwrap();

        let handle_a = TlfHandle::new([uid(1)], [], false).unwrap();
        let handle_b = TlfHandle::new([uid(1)], [uid(2)], false).unwrap();
        let (id_a, _) = server
            .get_for_handle(&ctx, &handle_a, MergeStatus::Merged)
            .unwrap();
        let (id_b, _) = server
            .get_for_handle(&ctx, &handle_b, MergeStatus::Merged)
            .unwrap();

        // Swap folder A's record for folder B's handle behind the
        // server's back.
        let bytes = serde_json::to_vec(&handle_b).unwrap();
        fs::write(
            temp.path().join(id_a.to_string()).join(HANDLE_FILE),
            bytes,
        )
        .unwrap();

        let server = MdServerDisk::open(temp.path(), uid(1), 1 << 20).unwrap();
        let err = server
            .get_for_handle(&ctx, &handle_a, MergeStatus::Merged)
            .unwrap_err();
        assert_eq!(
            err,
            MdServerError::ConflictFolderMapping {
                expected: id_a,
                actual: id_b,
            }
        );
    }

    #[test]
    fn prune_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let ctx = Ctx::background();
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();
        let server = MdServerDisk::open(temp.path(), uid(1), 1 << 20).unwrap();
        let (id, _) = server
            .get_for_handle(&ctx, &handle, MergeStatus::Merged)
            .unwrap();

        let bid = BranchId::mint();
        server.prune_branch(&ctx, id, bid).unwrap();
        server.prune_branch(&ctx, id, bid).unwrap();
        assert!(matches!(
            server.prune_branch(&ctx, id, BranchId::NULL),
            Err(MdServerError::BadRequest { .. })
        ));
    }
}
