//! Cooperative cancellation context threaded through suspending operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Returned from any suspension point after the context was cancelled.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct CtxInner {
    cancelled: AtomicBool,
}

/// Cancellation token.
///
/// Every operation that can suspend (disk fsync, server round-trip) takes a
/// `&Ctx` and checks it at its suspension points. Cancellation is
/// cooperative: an in-flight server put may still land after the caller
/// observes `Cancelled`.
#[derive(Clone, Debug)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

impl Ctx {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(CtxInner::default()),
        }
    }

    /// A context paired with a handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let ctx = Self::background();
        let handle = CancelHandle {
            inner: Arc::clone(&ctx.inner),
        };
        (ctx, handle)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Errs iff the context has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug)]
pub struct CancelHandle {
    inner: Arc<CtxInner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }
}
