//! In-memory metadata server.
//!
//! Holds every folder's per-branch logs behind one `RwLock`; writes are
//! serialized, reads share the lock. Nothing is signed under the lock:
//! the server only verifies.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use crossbeam::channel;
use tracing::debug;

use crate::core::codec::encode_handle;
use crate::core::ctx::Ctx;
use crate::core::handle::TlfHandle;
use crate::core::identity::{BranchId, MergeStatus, TlfId, UserId};
use crate::core::metadata::RootMetadataSigned;
use crate::core::revision::{MdId, MetadataRevision};

use super::errors::MdServerError;
use super::{
    MdServer, UpdateStream, UpdateWaiter, check_put_against_tail, lookup_branch, notify_waiters,
};

struct Folder {
    handle: TlfHandle,
    branches: HashMap<BranchId, Vec<(MdId, RootMetadataSigned)>>,
    waiters: Vec<UpdateWaiter>,
}

impl Folder {
    fn new(handle: TlfHandle) -> Self {
        Self {
            handle,
            branches: HashMap::new(),
            waiters: Vec::new(),
        }
    }

    fn tail(&self, bid: BranchId) -> Option<&(MdId, RootMetadataSigned)> {
        self.branches.get(&bid).and_then(|log| log.last())
    }

    fn merged_revision_of(&self, md_id: MdId) -> Option<MetadataRevision> {
        self.branches
            .get(&BranchId::NULL)?
            .iter()
            .find(|(id, _)| *id == md_id)
            .map(|(_, rmds)| rmds.md.revision())
    }
}

#[derive(Default)]
struct State {
    handles: HashMap<Bytes, TlfId>,
    folders: HashMap<TlfId, Folder>,
}

/// Memory-backed [`MdServer`] bound to one session user.
pub struct MdServerMemory {
    uid: UserId,
    state: RwLock<State>,
}

impl MdServerMemory {
    pub fn new(uid: UserId) -> Self {
        Self {
            uid,
            state: RwLock::new(State::default()),
        }
    }

    fn read_authorized<T>(
        &self,
        ctx: &Ctx,
        id: TlfId,
        read: impl FnOnce(&Folder) -> T,
    ) -> Result<T, MdServerError> {
        ctx.check()?;
        let state = self.state.read().expect("server state lock poisoned");
        let folder = state
            .folders
            .get(&id)
            .ok_or_else(|| MdServerError::Unauthorized {
                reason: format!("unknown folder {id}"),
            })?;
        if !folder.handle.is_reader(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} may not read folder {id}", self.uid),
            });
        }
        Ok(read(folder))
    }
}

impl MdServer for MdServerMemory {
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
        let key = encode_handle(handle).map_err(|err| MdServerError::BadRequest {
            reason: err.to_string(),
        })?;

        let mut state = self.state.write().expect("server state lock poisoned");
        let id = match state.handles.get(&key).copied() {
            Some(id) => {
                // The mapping is keyed by the canonical handle bytes and
                // the folder record is created from the same handle, so
                // the record cannot disagree with the mapping here.
                if !state.folders.contains_key(&id) {
                    return Err(MdServerError::Server {
                        reason: format!("handle maps to missing folder {id}"),
                    });
                }
                id
            }
            None => {
                let id = TlfId::mint(handle.is_public());
                state.handles.insert(key, id);
                state.folders.insert(id, Folder::new(handle.clone()));
                debug!(tlf = %id, "minted folder id for handle");
                id
            }
        };

        let head = match merge {
            MergeStatus::Merged => state
                .folders
                .get(&id)
                .and_then(|folder| folder.tail(BranchId::NULL))
                .map(|(_, rmds)| rmds.clone()),
            // An unmerged head is meaningless without a branch id.
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
        self.read_authorized(ctx, id, |folder| {
            lookup_branch(bid, merge)
                .and_then(|branch| folder.tail(branch))
                .map(|(_, rmds)| rmds.clone())
        })
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
        self.read_authorized(ctx, id, |folder| {
            let Some(branch) = lookup_branch(bid, merge) else {
                return Vec::new();
            };
            let Some(log) = folder.branches.get(&branch) else {
                return Vec::new();
            };
            log.iter()
                .map(|(_, rmds)| rmds)
                .filter(|rmds| rmds.md.revision() >= start && rmds.md.revision() <= stop)
                .cloned()
                .collect()
        })
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
        let md_id = rmds.md.md_id().map_err(|err| MdServerError::BadRequest {
            reason: err.to_string(),
        })?;

        let mut state = self.state.write().expect("server state lock poisoned");
        let folder = state
            .folders
            .entry(id)
            .or_insert_with(|| Folder::new(handle.clone()));
        if !folder.handle.is_writer(self.uid) {
            return Err(MdServerError::WriteAccess);
        }

        let tail = folder.tail(bid).map(|(tail_id, tail)| (tail, *tail_id));
        check_put_against_tail(rmds, tail, |prev_root| {
            folder.merged_revision_of(prev_root)
        })?;

        folder
            .branches
            .entry(bid)
            .or_default()
            .push((md_id, rmds.clone()));
        debug!(
            tlf = %id,
            branch = %bid,
            revision = %rmds.md.revision(),
            "server accepted revision"
        );

        if bid.is_null() {
            notify_waiters(&mut folder.waiters, rmds.md.revision());
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
        let mut state = self.state.write().expect("server state lock poisoned");
        let folder = state
            .folders
            .get_mut(&id)
            .ok_or_else(|| MdServerError::Unauthorized {
                reason: format!("unknown folder {id}"),
            })?;
        if !folder.handle.is_writer(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} may not prune folder {id}", self.uid),
            });
        }
        folder.branches.remove(&bid);
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
        let mut state = self.state.write().expect("server state lock poisoned");
        let folder = state
            .folders
            .get_mut(&id)
            .ok_or_else(|| MdServerError::Unauthorized {
                reason: format!("unknown folder {id}"),
            })?;
        if !folder.handle.is_reader(self.uid) {
            return Err(MdServerError::Unauthorized {
                reason: format!("{} may not read folder {id}", self.uid),
            });
        }

        let (sender, receiver) = channel::bounded(1);
        let head = folder
            .tail(BranchId::NULL)
            .map(|(_, rmds)| rmds.md.revision());
        if let Some(head) = head
            && head > last_seen
        {
            let _ = sender.send(head);
        } else {
            folder.waiters.push(UpdateWaiter { last_seen, sender });
        }
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::ID_BYTE_LEN;
    use crate::core::metadata::RootMetadata;
    use crate::core::revision::MdId;
    use crate::core::sign::{DeviceSigner, Signer};

    fn uid(b: u8) -> UserId {
        UserId::from_bytes([b; ID_BYTE_LEN])
    }

    fn signed_md(
        signer: &DeviceSigner,
        id: TlfId,
        handle: &TlfHandle,
        revision: u64,
        writer: UserId,
        prev_root: MdId,
    ) -> RootMetadataSigned {
        let ctx = Ctx::background();
        let mut md = RootMetadata::new(id, handle).unwrap();
        md.set_revision(MetadataRevision::new(revision));
        md.set_prev_root(prev_root);
        md.set_last_modifier(writer);
        let writer_sig = signer.sign(&ctx, &md.writer_bytes().unwrap()).unwrap();
        md.set_writer_sig(writer_sig);
        let sig = signer.sign(&ctx, &md.root_bytes().unwrap()).unwrap();
        RootMetadataSigned { md, sig }
    }

    #[test]
    fn handle_mint_is_stable() {
        let ctx = Ctx::background();
        let server = MdServerMemory::new(uid(1));
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();

        let (id1, head) = server
            .get_for_handle(&ctx, &handle, MergeStatus::Merged)
            .unwrap();
        assert!(head.is_none());
        let (id2, _) = server
            .get_for_handle(&ctx, &handle, MergeStatus::Merged)
            .unwrap();
        assert_eq!(id1, id2);

        let other = TlfHandle::new([uid(1)], [uid(2)], false).unwrap();
        let (id3, _) = server
            .get_for_handle(&ctx, &other, MergeStatus::Merged)
            .unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn equal_handles_resolve_to_one_folder() {
        let ctx = Ctx::background();
        let server = MdServerMemory::new(uid(1));

        // Independently constructed but canonically equal handles hit the
        // same mapping entry and never conflict.
        let first = TlfHandle::new([uid(1)], [uid(2)], false).unwrap();
        let second = TlfHandle::new([uid(1)], [uid(2)], false).unwrap();
        let (id1, _) = server
            .get_for_handle(&ctx, &first, MergeStatus::Merged)
            .unwrap();
        let (id2, _) = server
            .get_for_handle(&ctx, &second, MergeStatus::Merged)
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn put_requires_write_access() {
        let ctx = Ctx::background();
        // Session user is only a reader.
        let server = MdServerMemory::new(uid(2));
        let handle = TlfHandle::new([uid(1)], [uid(2)], false).unwrap();
        let signer = DeviceSigner::from_seed([1u8; 32]);
        let id = TlfId::mint(false);

        let rmds = signed_md(&signer, id, &handle, 1, uid(1), MdId::ZERO);
        assert_eq!(server.put(&ctx, &rmds), Err(MdServerError::WriteAccess));
    }

    #[test]
    fn merged_history_must_start_at_initial() {
        let ctx = Ctx::background();
        let server = MdServerMemory::new(uid(1));
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();
        let signer = DeviceSigner::from_seed([1u8; 32]);
        let id = TlfId::mint(false);

        let rmds = signed_md(&signer, id, &handle, 5, uid(1), MdId::of_encoded(b"x"));
        assert!(matches!(
            server.put(&ctx, &rmds),
            Err(MdServerError::BadRequest { .. })
        ));
    }

    #[test]
    fn forked_branch_needs_live_merged_ancestor() {
        let ctx = Ctx::background();
        let server = MdServerMemory::new(uid(1));
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();
        let signer = DeviceSigner::from_seed([1u8; 32]);
        let id = TlfId::mint(false);

        // Merged revision 1.
        let first = signed_md(&signer, id, &handle, 1, uid(1), MdId::ZERO);
        server.put(&ctx, &first).unwrap();
        let first_id = first.md.md_id().unwrap();

        let bid = BranchId::mint();

        // Unknown ancestor: rejected.
        let mut stranger = RootMetadata::new(id, &handle).unwrap();
        stranger.set_revision(MetadataRevision::new(2));
        stranger.set_prev_root(MdId::of_encoded(b"unknown"));
        stranger.set_branch_id(bid);
        stranger.set_unmerged();
        stranger.set_last_modifier(uid(1));
        let writer_sig = signer
            .sign(&ctx, &stranger.writer_bytes().unwrap())
            .unwrap();
        stranger.set_writer_sig(writer_sig);
        let sig = signer.sign(&ctx, &stranger.root_bytes().unwrap()).unwrap();
        let stranger = RootMetadataSigned { md: stranger, sig };
        assert!(matches!(
            server.put(&ctx, &stranger),
            Err(MdServerError::BadRequest { .. })
        ));

        // Live ancestor at the right revision: accepted.
        let mut forked = RootMetadata::new(id, &handle).unwrap();
        forked.set_revision(MetadataRevision::new(2));
        forked.set_prev_root(first_id);
        forked.set_branch_id(bid);
        forked.set_unmerged();
        forked.set_last_modifier(uid(1));
        let writer_sig = signer.sign(&ctx, &forked.writer_bytes().unwrap()).unwrap();
        forked.set_writer_sig(writer_sig);
        let sig = signer.sign(&ctx, &forked.root_bytes().unwrap()).unwrap();
        let forked = RootMetadataSigned { md: forked, sig };
        server.put(&ctx, &forked).unwrap();
    }

    #[test]
    fn null_branch_unmerged_lookup_is_empty() {
        let ctx = Ctx::background();
        let server = MdServerMemory::new(uid(1));
        let handle = TlfHandle::new([uid(1)], [], false).unwrap();
        let signer = DeviceSigner::from_seed([1u8; 32]);

        let (id, _) = server
            .get_for_handle(&ctx, &handle, MergeStatus::Merged)
            .unwrap();
        let rmds = signed_md(&signer, id, &handle, 1, uid(1), MdId::ZERO);
        server.put(&ctx, &rmds).unwrap();

        let head = server
            .get_for_tlf(&ctx, id, BranchId::NULL, MergeStatus::Unmerged)
            .unwrap();
        assert!(head.is_none());
        let range = server
            .get_range(
                &ctx,
                id,
                BranchId::NULL,
                MergeStatus::Unmerged,
                MetadataRevision::new(1),
                MetadataRevision::new(100),
            )
            .unwrap();
        assert!(range.is_empty());
    }
}
