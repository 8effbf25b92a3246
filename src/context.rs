/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, ErrorKind, Result};

const MAX_WAIT_SLICE: Duration = Duration::from_millis(5);

/// Cancellation token with an optional deadline.
///
/// Long-running operations take a `&Context` and poll it at every boundary:
/// before starting, at directory-entry boundaries, between stream chunks and
/// between lock retries. Derived contexts observe their parent's
/// cancellation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextState>,
}

struct ContextState {
    cancelled: Mutex<Option<ErrorKind>>,
    wakeup: Condvar,
    deadline: Option<Instant>,
    parent: Option<Arc<ContextState>>,
}

impl ContextState {
    fn failure(&self) -> Option<ErrorKind> {
        if let Some(kind) = *self.cancelled.lock() {
            return Some(kind);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ErrorKind::Timeout);
            }
        }
        match &self.parent {
            Some(parent) => parent.failure(),
            None => None,
        }
    }
}

/// Cancels the context it was derived with. Cancellation is idempotent.
pub struct CancelFunc {
    inner: Arc<ContextState>,
}

impl CancelFunc {
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if cancelled.is_none() {
            *cancelled = Some(ErrorKind::Cancelled);
        }
        self.inner.wakeup.notify_all();
    }
}

impl Context {
    /// Root context: never cancelled, no deadline.
    pub fn background() -> Self {
        Context {
            inner: Arc::new(ContextState {
                cancelled: Mutex::new(None),
                wakeup: Condvar::new(),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Derived context with an explicit cancel function.
    pub fn with_cancel(&self) -> (Context, CancelFunc) {
        let inner = Arc::new(ContextState {
            cancelled: Mutex::new(None),
            wakeup: Condvar::new(),
            deadline: None,
            parent: Some(self.inner.clone()),
        });
        (
            Context {
                inner: inner.clone(),
            },
            CancelFunc { inner },
        )
    }

    /// Derived context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelFunc) {
        let inner = Arc::new(ContextState {
            cancelled: Mutex::new(None),
            wakeup: Condvar::new(),
            deadline: Some(Instant::now() + timeout),
            parent: Some(self.inner.clone()),
        });
        (
            Context {
                inner: inner.clone(),
            },
            CancelFunc { inner },
        )
    }

    /// Fails with `Cancelled` after cancellation, `Timeout` after deadline
    /// expiry, in itself or any ancestor.
    pub fn check(&self) -> Result<()> {
        match self.inner.failure() {
            None => Ok(()),
            Some(ErrorKind::Timeout) => {
                Err(Error::new(ErrorKind::Timeout, "context deadline exceeded"))
            }
            Some(_) => Err(Error::new(ErrorKind::Cancelled, "context cancelled")),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.failure().is_some()
    }

    /// Sleeps for `duration`, waking early (with the cancellation error) if
    /// the context is cancelled or expires in the meantime.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let slice = (until - now).min(MAX_WAIT_SLICE);
            let mut cancelled = self.inner.cancelled.lock();
            if cancelled.is_none() {
                let _ = self.inner.wakeup.wait_for(&mut cancelled, slice);
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_done() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(!ctx.is_done());
    }

    #[test]
    fn test_cancel_fails_with_cancelled() {
        let (ctx, cancel) = Context::background().with_cancel();
        assert!(ctx.check().is_ok());
        cancel.cancel();
        assert_eq!(ErrorKind::Cancelled, ctx.check().unwrap_err().kind());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        cancel.cancel();
        assert_eq!(ErrorKind::Cancelled, ctx.check().unwrap_err().kind());
    }

    #[test]
    fn test_timeout_fails_with_timeout() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
        assert!(ctx.check().is_ok());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ErrorKind::Timeout, ctx.check().unwrap_err().kind());
    }

    #[test]
    fn test_child_observes_parent_cancellation() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_timeout(Duration::from_secs(60));
        cancel.cancel();
        assert_eq!(ErrorKind::Cancelled, child.check().unwrap_err().kind());
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let ctx = Context::background();
        let started = Instant::now();
        ctx.sleep(Duration::from_millis(20)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = std::thread::spawn(move || ctx.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let result = waiter.join().unwrap();
        assert_eq!(ErrorKind::Cancelled, result.unwrap_err().kind());
    }

    #[test]
    fn test_sleep_observes_deadline() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
        let result = ctx.sleep(Duration::from_secs(30));
        assert_eq!(ErrorKind::Timeout, result.unwrap_err().kind());
    }
}
