//! Metadata server: the authoritative serial log per (TLF, branch).

use crossbeam::channel::{Receiver, Sender};

use crate::core::ctx::Ctx;
use crate::core::handle::TlfHandle;
use crate::core::identity::{BranchId, MergeStatus, TlfId};
use crate::core::metadata::RootMetadataSigned;
use crate::core::revision::{MdId, MetadataRevision};
use crate::journal::md_journal::MdFlushTarget;

pub mod disk;
pub mod errors;
pub mod memory;

pub use disk::MdServerDisk;
pub use errors::{MdServerError, ServerStatus, unwrap_server_status};
pub use memory::MdServerMemory;

/// One-shot notification stream: yields the new merged head revision the
/// first time it advances past the registered watermark.
pub type UpdateStream = Receiver<MetadataRevision>;

/// Authoritative metadata server surface.
///
/// Implementations serialize writes per TLF; reads may run concurrently.
pub trait MdServer {
    /// Resolves (minting if necessary) the folder id for a handle, plus
    /// the current head, if any, for the requested merge status.
    fn get_for_handle(
        &self,
        ctx: &Ctx,
        handle: &TlfHandle,
        merge: MergeStatus,
    ) -> Result<(TlfId, Option<RootMetadataSigned>), MdServerError>;

    /// Tail of the requested branch; `None` if the branch is empty.
    fn get_for_tlf(
        &self,
        ctx: &Ctx,
        id: TlfId,
        bid: BranchId,
        merge: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>, MdServerError>;

    /// Revisions in `[start, stop]` on the requested branch, ascending.
    fn get_range(
        &self,
        ctx: &Ctx,
        id: TlfId,
        bid: BranchId,
        merge: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>, MdServerError>;

    /// Conditional append to (rmds.tlf, rmds.branch).
    fn put(&self, ctx: &Ctx, rmds: &RootMetadataSigned) -> Result<(), MdServerError>;

    /// Deletes every entry on a non-null branch. Idempotent.
    fn prune_branch(&self, ctx: &Ctx, id: TlfId, bid: BranchId) -> Result<(), MdServerError>;

    /// Subscribes to a notification once the merged head advances past
    /// `last_seen`.
    fn register_for_update(
        &self,
        ctx: &Ctx,
        id: TlfId,
        last_seen: MetadataRevision,
    ) -> Result<UpdateStream, MdServerError>;
}

impl<S: MdServer> MdFlushTarget for S {
    fn put(&self, ctx: &Ctx, rmds: &RootMetadataSigned) -> Result<(), MdServerError> {
        MdServer::put(self, ctx, rmds)
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
        MdServer::get_range(self, ctx, id, bid, merge, start, stop)
    }
}

/// Resolves a (branch id, merge status) lookup pair to the branch it
/// names, or `None` when the pair is inconsistent (such lookups return
/// empty results rather than errors).
pub(crate) fn lookup_branch(bid: BranchId, merge: MergeStatus) -> Option<BranchId> {
    match merge {
        MergeStatus::Merged if bid.is_null() => Some(BranchId::NULL),
        MergeStatus::Unmerged if !bid.is_null() => Some(bid),
        _ => None,
    }
}

/// The conditional-append rule shared by server implementations.
///
/// `tail` is the current tail of the target branch with its content id;
/// `merged_ancestor` resolves a content id to its revision on the merged
/// branch of the same TLF (for the first entry of a forked branch).
pub(crate) fn check_put_against_tail(
    rmds: &RootMetadataSigned,
    tail: Option<(&RootMetadataSigned, MdId)>,
    merged_ancestor: impl FnOnce(MdId) -> Option<MetadataRevision>,
) -> Result<(), MdServerError> {
    match tail {
        Some((tail_rmds, tail_id)) => {
            if tail_rmds
                .md
                .check_valid_successor(tail_id, &rmds.md)
                .is_ok()
            {
                return Ok(());
            }
            if rmds.md.revision() <= tail_rmds.md.revision() {
                return Err(MdServerError::ConflictRevision {
                    expected: tail_rmds.md.revision().next(),
                    actual: rmds.md.revision(),
                });
            }
            if rmds.md.prev_root() != tail_id {
                return Err(MdServerError::ConflictPrevRoot {
                    expected: tail_id,
                    actual: rmds.md.prev_root(),
                });
            }
            Err(MdServerError::BadRequest {
                reason: format!(
                    "revision {} leaves a gap after tail {}",
                    rmds.md.revision(),
                    tail_rmds.md.revision()
                ),
            })
        }
        None if rmds.md.branch_id().is_null() => {
            if rmds.md.revision() != MetadataRevision::INITIAL {
                return Err(MdServerError::BadRequest {
                    reason: format!(
                        "merged history must start at revision {}, got {}",
                        MetadataRevision::INITIAL,
                        rmds.md.revision()
                    ),
                });
            }
            Ok(())
        }
        None => {
            // First entry of a forked branch must hang off a live merged
            // ancestor.
            let Some(ancestor_revision) = merged_ancestor(rmds.md.prev_root()) else {
                return Err(MdServerError::BadRequest {
                    reason: "previous root does not name a merged revision of this folder"
                        .to_string(),
                });
            };
            if rmds.md.revision() != ancestor_revision.next() {
                return Err(MdServerError::BadRequest {
                    reason: format!(
                        "branch must start at revision {}, got {}",
                        ancestor_revision.next(),
                        rmds.md.revision()
                    ),
                });
            }
            Ok(())
        }
    }
}

/// A registered update subscription.
pub(crate) struct UpdateWaiter {
    pub last_seen: MetadataRevision,
    pub sender: Sender<MetadataRevision>,
}

/// Fires and removes every waiter whose watermark the new merged head
/// passed.
pub(crate) fn notify_waiters(waiters: &mut Vec<UpdateWaiter>, head: MetadataRevision) {
    waiters.retain(|waiter| {
        if head > waiter.last_seen {
            let _ = waiter.sender.send(head);
            false
        } else {
            true
        }
    });
}
