/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::context::{CancelFunc, Context};
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::{FileMode, FileSystem};
use crate::transfer;

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(50);
const TIME_BETWEEN_LOCK_TRIES: Duration = Duration::from_millis(10);
const UNLOCK_ATTEMPTS: u32 = 10;
const UNLOCK_MAX_JITTER_MS: u64 = 25;
const MAKE_STALE_ATTEMPTS: u32 = 5;

/// Mutual exclusion built from filesystem primitives alone.
///
/// The lock is the directory `<dir>/lockfile-<id>/`; creating it atomically
/// acquires the lock. A background task refreshes a heartbeat file
/// `<id>.lock` inside it so other processes can tell a held lock from a
/// stale one (no heartbeat progress within twice the period).
pub struct RemoteLockFile {
    fs: Arc<dyn FileSystem>,
    lock_id: String,
    lock_dir: PathBuf,
    heartbeat_period: Duration,
    override_stale_lock: bool,
    heartbeat: Mutex<Option<Heartbeat>>,
}

struct Heartbeat {
    cancel: CancelFunc,
    thread: JoinHandle<()>,
}

impl RemoteLockFile {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        lock_id: impl Into<String>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        let lock_id = lock_id.into();
        let lock_dir = directory.into().join(format!("lockfile-{}", lock_id));
        RemoteLockFile {
            fs,
            lock_id,
            lock_dir,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            override_stale_lock: false,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Stale locks found during `try_lock` are deleted and the acquisition
    /// retried once.
    pub fn with_override_stale_lock(mut self) -> Self {
        self.override_stale_lock = true;
        self
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    fn heartbeat_file(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", self.lock_id))
    }

    fn staleness_threshold(&self) -> Duration {
        2 * self.heartbeat_period
    }

    /// Single acquisition attempt.
    ///
    /// Fails with `Locked` while another holder's heartbeat is fresh, with
    /// `StaleLock` when the holder looks dead and overriding is off.
    pub fn try_lock(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        match self.fs.create_dir(&self.lock_dir, FileMode::directory(0o755)) {
            Ok(()) => {
                self.acquired();
                Ok(())
            }
            Err(err) if err.is(ErrorKind::Exists) => {
                if !self.is_stale() {
                    return Err(Error::new(
                        ErrorKind::Locked,
                        format!("lock '{}' is held elsewhere", self.lock_id),
                    ));
                }
                if !self.override_stale_lock {
                    return Err(Error::new(
                        ErrorKind::StaleLock,
                        format!("lock '{}' is stale", self.lock_id),
                    ));
                }
                warn!("removing stale lock '{}'", self.lock_dir.display());
                transfer::rm(ctx, self.fs.as_ref(), &self.lock_dir)?;
                match self.fs.create_dir(&self.lock_dir, FileMode::directory(0o755)) {
                    Ok(()) => {
                        self.acquired();
                        Ok(())
                    }
                    Err(retry_err) if retry_err.is(ErrorKind::Exists) => Err(Error::new(
                        ErrorKind::Locked,
                        format!("lock '{}' was re-acquired elsewhere", self.lock_id),
                    )),
                    Err(retry_err) => Err(retry_err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn acquired(&self) {
        // some backends do not set times on create
        let now = SystemTime::now();
        let _ = self.fs.chtimes(&self.lock_dir, now, now);
        info!("acquired lock '{}'", self.lock_dir.display());
        self.start_heartbeat();
    }

    fn start_heartbeat(&self) {
        let (ctx, cancel) = Context::background().with_cancel();
        let fs = self.fs.clone();
        let heartbeat_file = self.heartbeat_file();
        let lock_dir = self.lock_dir.clone();
        let period = self.heartbeat_period.saturating_sub(Duration::from_millis(1));
        let thread = std::thread::spawn(move || loop {
            if ctx.sleep(period).is_err() {
                return;
            }
            let now = SystemTime::now();
            let message = format!("alive @ {:?}", now);
            if let Err(err) = fs.write_file(
                &heartbeat_file,
                message.as_bytes(),
                FileMode::regular(0o644),
            ) {
                debug!(
                    "heartbeat write to '{}' failed: {}",
                    heartbeat_file.display(),
                    err
                );
                continue;
            }
            let _ = fs.chtimes(&heartbeat_file, now, now);
            let _ = fs.chtimes(&lock_dir, now, now);
        });
        *self.heartbeat.lock() = Some(Heartbeat { cancel, thread });
    }

    fn stop_heartbeat(&self) {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel.cancel();
            let _ = heartbeat.thread.join();
        }
    }

    /// Blocking acquisition: retries every 10ms until the lock is free, the
    /// context ends, or the attempt fails with anything but `Locked`.
    pub fn lock(&self, ctx: &Context) -> Result<()> {
        loop {
            match self.try_lock(ctx) {
                Err(err) if err.is(ErrorKind::Locked) => ctx.sleep(TIME_BETWEEN_LOCK_TRIES)?,
                outcome => return outcome,
            }
        }
    }

    /// Bounded acquisition: `Timeout` once `timeout` elapses, cancelling the
    /// in-flight attempt.
    pub fn lock_with_timeout(&self, ctx: &Context, timeout: Duration) -> Result<()> {
        let (bounded, cancel) = ctx.with_timeout(timeout);
        let outcome = self.lock(&bounded);
        cancel.cancel();
        outcome
    }

    /// True when the holder's heartbeat has not advanced within twice the
    /// heartbeat period (an empty lock directory is judged by its own age).
    pub fn is_stale(&self) -> bool {
        let threshold = self.staleness_threshold();
        let entries = match self.fs.read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        if entries.is_empty() {
            return self.older_than(&self.lock_dir, threshold);
        }
        entries.iter().all(|entry| {
            self.older_than(&self.lock_dir.join(entry.name()), threshold)
        })
    }

    fn older_than(&self, path: &std::path::Path, threshold: Duration) -> bool {
        match self.fs.stat_times(path) {
            Ok(times) => match SystemTime::now().duration_since(times.mod_time()) {
                Ok(age) => age > threshold,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Releases the lock: stops the heartbeat, then removes the lock
    /// directory with up to 10 jittered attempts. Fails with `Locked` when
    /// the directory refuses to go away.
    pub fn unlock(&self, ctx: &Context) -> Result<()> {
        self.stop_heartbeat();
        for attempt in 0..UNLOCK_ATTEMPTS {
            ctx.check()?;
            if let Err(err) = transfer::rm(ctx, self.fs.as_ref(), &self.lock_dir) {
                debug!(
                    "unlock attempt {} on '{}' failed: {}",
                    attempt + 1,
                    self.lock_dir.display(),
                    err
                );
            }
            if !self.fs.exists(&self.lock_dir) {
                info!("released lock '{}'", self.lock_dir.display());
                return Ok(());
            }
            let jitter = rand::thread_rng().gen_range(1..=UNLOCK_MAX_JITTER_MS.min(1u64 << attempt));
            ctx.sleep(Duration::from_millis(jitter))?;
        }
        Err(Error::new(
            ErrorKind::Locked,
            format!("could not release lock '{}'", self.lock_dir.display()),
        ))
    }

    /// Forced release, honoured only when the lock is stale.
    pub fn release_if_stale(&self, ctx: &Context) -> Result<()> {
        if !self.is_stale() {
            return Ok(());
        }
        self.unlock(ctx)
    }

    /// Test hook: kills the heartbeat and backdates the on-disk state past
    /// the staleness threshold, retrying for backends with coarse time
    /// resolution.
    pub fn make_stale(&self, ctx: &Context) -> Result<()> {
        self.stop_heartbeat();
        let mut backdate = self.staleness_threshold() + self.heartbeat_period;
        for _ in 0..MAKE_STALE_ATTEMPTS {
            ctx.check()?;
            let stale_time = SystemTime::now() - backdate;
            let _ = self.fs.chtimes(&self.heartbeat_file(), stale_time, stale_time);
            self.fs.chtimes(&self.lock_dir, stale_time, stale_time)?;
            if self.is_stale() {
                return Ok(());
            }
            backdate *= 2;
        }
        Err(Error::new(
            ErrorKind::Unexpected,
            format!("could not make lock '{}' stale", self.lock_dir.display()),
        ))
    }
}

impl Drop for RemoteLockFile {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{MemFs, OsFs};
    use std::path::Path;

    fn mem_lock(fs: &MemFs, id: &str) -> RemoteLockFile {
        RemoteLockFile::new(Arc::new(fs.clone()), id, "/locks")
    }

    #[test]
    fn test_try_lock_and_unlock() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let lock = mem_lock(&fs, "alpha");
        lock.try_lock(&ctx).unwrap();
        assert!(fs.exists(Path::new("/locks/lockfile-alpha")));
        lock.unlock(&ctx).unwrap();
        assert!(!fs.exists(Path::new("/locks/lockfile-alpha")));
    }

    #[test]
    fn test_second_holder_fails_locked() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let first = mem_lock(&fs, "beta");
        let second = mem_lock(&fs, "beta");
        first.try_lock(&ctx).unwrap();
        let err = second.try_lock(&ctx).unwrap_err();
        assert_eq!(ErrorKind::Locked, err.kind());
        first.unlock(&ctx).unwrap();
        second.try_lock(&ctx).unwrap();
        second.unlock(&ctx).unwrap();
    }

    #[test]
    fn test_lock_with_timeout_while_held() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let holder = mem_lock(&fs, "gamma");
        let waiter = mem_lock(&fs, "gamma");
        holder.try_lock(&ctx).unwrap();
        let err = waiter
            .lock_with_timeout(&ctx, Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(ErrorKind::Timeout, err.kind());
        holder.unlock(&ctx).unwrap();
        waiter.lock_with_timeout(&ctx, Duration::from_secs(2)).unwrap();
        waiter.unlock(&ctx).unwrap();
    }

    #[test]
    fn test_heartbeat_keeps_lock_fresh() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let lock = mem_lock(&fs, "delta");
        lock.try_lock(&ctx).unwrap();
        // five heartbeat periods of liveness
        std::thread::sleep(5 * DEFAULT_HEARTBEAT_PERIOD);
        assert!(!lock.is_stale());
        lock.unlock(&ctx).unwrap();
    }

    #[test]
    fn test_make_stale_and_stale_lock_error() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let holder = mem_lock(&fs, "epsilon");
        holder.try_lock(&ctx).unwrap();
        holder.make_stale(&ctx).unwrap();
        assert!(holder.is_stale());

        let contender = mem_lock(&fs, "epsilon");
        let err = contender.try_lock(&ctx).unwrap_err();
        assert_eq!(ErrorKind::StaleLock, err.kind());

        let overrider = mem_lock(&fs, "epsilon").with_override_stale_lock();
        overrider.try_lock(&ctx).unwrap();
        assert!(!overrider.is_stale());
        overrider.unlock(&ctx).unwrap();
    }

    #[test]
    fn test_release_if_stale_only_acts_on_stale_locks() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/locks")).unwrap();
        let ctx = Context::background();
        let lock = mem_lock(&fs, "zeta");
        lock.try_lock(&ctx).unwrap();
        // held and fresh: nothing happens
        lock.release_if_stale(&ctx).unwrap();
        assert!(fs.exists(Path::new("/locks/lockfile-zeta")));
        lock.make_stale(&ctx).unwrap();
        lock.release_if_stale(&ctx).unwrap();
        assert!(!fs.exists(Path::new("/locks/lockfile-zeta")));
    }

    #[test]
    fn test_concurrent_try_lock_single_winner_on_disk() {
        let scratch = tempfile::tempdir().unwrap();
        let ctx = Context::background();
        let fs: Arc<dyn crate::filesystem::FileSystem> = Arc::new(OsFs::new());
        let make = || RemoteLockFile::new(fs.clone(), "race", scratch.path());
        let first = make();
        let second = make();
        let results = std::thread::scope(|scope| {
            let a = scope.spawn(|| first.try_lock(&Context::background()));
            let b = scope.spawn(|| second.try_lock(&Context::background()));
            (a.join().unwrap(), b.join().unwrap())
        });
        let winners = [&results.0, &results.1]
            .iter()
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(1, winners);
        let first_won = results.0.is_ok();
        let loser = if first_won { results.1 } else { results.0 };
        assert_eq!(ErrorKind::Locked, loser.unwrap_err().kind());
        if first_won {
            first.unlock(&ctx).unwrap();
        } else {
            second.unlock(&ctx).unwrap();
        }
    }
}
