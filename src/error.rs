use thiserror::Error;

use crate::core::CoreError;
use crate::journal::MdJournalError;
use crate::server::MdServerError;

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors; match on the
/// capability variants for anything beyond propagation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Journal(#[from] MdJournalError),

    #[error(transparent)]
    Server(#[from] MdServerError),
}
