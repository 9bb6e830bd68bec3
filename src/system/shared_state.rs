//! Shared state between the caller thread (tracking) and the mapping worker.
//!
//! The map lives behind `RwLock<Arc<Map>>`: readers clone the `Arc` and work
//! on an immutable snapshot; the single writer clones the map, mutates the
//! copy and swaps the pointer. The lock is only held for the swap, so a
//! mapping pass becomes visible atomically and never blocks tracking.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::ResultCode;
use crate::map::Map;
use crate::tracking::result::Pose;
use crate::tracking::SystemState;

use super::config::SlamConfig;
use super::events::Callbacks;

pub struct SharedState {
    /// Current committed map.
    map: RwLock<Arc<Map>>,

    /// Serializes writers (mapping passes, bootstrap, clear/load).
    writer: Mutex<()>,

    /// Bumped whenever the map is replaced wholesale; work queued against an
    /// older map is discarded.
    epoch: AtomicU64,

    state: Mutex<SystemState>,
    failure: Mutex<Option<String>>,
    config: RwLock<SlamConfig>,
    callbacks: RwLock<Callbacks>,

    /// Request the mapping worker to exit.
    shutdown_requested: AtomicBool,

    /// Signal to abort bundle adjustment early (reset / load pending).
    abort_ba: AtomicBool,

    loop_closure_count: AtomicU64,
    peak_memory_bytes: AtomicUsize,
}

impl SharedState {
    pub fn new(map: Map, config: SlamConfig) -> Arc<Self> {
        let bytes = map.memory_usage_bytes();
        Arc::new(Self {
            map: RwLock::new(Arc::new(map)),
            writer: Mutex::new(()),
            epoch: AtomicU64::new(0),
            state: Mutex::new(SystemState::Uninitialized),
            failure: Mutex::new(None),
            config: RwLock::new(config),
            callbacks: RwLock::new(Callbacks::default()),
            shutdown_requested: AtomicBool::new(false),
            abort_ba: AtomicBool::new(false),
            loop_closure_count: AtomicU64::new(0),
            peak_memory_bytes: AtomicUsize::new(bytes),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map access
    // ─────────────────────────────────────────────────────────────────────────

    /// The map as of the last completed commit.
    pub fn snapshot(&self) -> Arc<Map> {
        Arc::clone(&self.map.read())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Run `f` on a private copy of the map and publish it if `f` succeeds.
    ///
    /// Returns `None` without running `f` when `epoch` is stale.
    pub fn try_commit<R, E>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut Map) -> Result<R, E>,
    ) -> Option<Result<R, E>> {
        let _writer = self.writer.lock();
        if epoch != self.epoch() {
            return None;
        }
        let mut working = Map::clone(&self.snapshot());
        let out = match f(&mut working) {
            Ok(out) => out,
            Err(e) => return Some(Err(e)),
        };
        self.note_memory(working.memory_usage_bytes());
        *self.map.write() = Arc::new(working);
        Some(Ok(out))
    }

    /// Replace the active map wholesale and invalidate queued work.
    pub fn replace_map(&self, map: Map) {
        self.abort_ba.store(true, Ordering::SeqCst);
        let _writer = self.writer.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.note_memory(map.memory_usage_bytes());
        *self.map.write() = Arc::new(map);
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> SystemState {
        *self.state.lock()
    }

    /// Move to `next` if the state machine allows it, firing the
    /// state-change callback. Returns whether the state changed.
    pub fn set_state(&self, next: SystemState) -> bool {
        let prev = {
            let mut state = self.state.lock();
            let prev = *state;
            if prev == next {
                return false;
            }
            if !prev.can_transition_to(next) {
                warn!("[System] Ignoring transition {} -> {}", prev, next);
                return false;
            }
            *state = next;
            prev
        };
        info!("[System] State {} -> {}", prev, next);
        let callback = self.callbacks.read().on_state_change.clone();
        if let Some(cb) = callback {
            cb(prev, next);
        }
        true
    }

    /// Enter FAILED and report the reason through the error callback.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("[System] Unrecoverable failure: {}", reason);
        *self.failure.lock() = Some(reason.clone());
        self.set_state(SystemState::Failed);
        self.report_error(ResultCode::ProcessingFailed, &reason);
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.state() == SystemState::Failed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration and callbacks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> SlamConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: SlamConfig) {
        *self.config.write() = config;
    }

    pub fn with_callbacks<R>(&self, f: impl FnOnce(&mut Callbacks) -> R) -> R {
        f(&mut self.callbacks.write())
    }

    pub fn report_error(&self, code: ResultCode, message: &str) {
        let callback = self.callbacks.read().on_error.clone();
        if let Some(cb) = callback {
            cb(code, message);
        }
    }

    pub fn report_pose(&self, pose: &Pose) {
        let callback = self.callbacks.read().on_pose_update.clone();
        if let Some(cb) = callback {
            cb(pose);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker flags
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_loop_closure(&self) {
        self.loop_closure_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn loop_closure_count(&self) -> u64 {
        self.loop_closure_count.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.loop_closure_count.store(0, Ordering::SeqCst);
    }

    fn note_memory(&self, bytes: usize) {
        self.peak_memory_bytes.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn peak_memory_bytes(&self) -> usize {
        self.peak_memory_bytes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.snapshot();
        f.debug_struct("SharedState")
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .field("keyframes", &map.num_keyframes())
            .field("landmarks", &map.num_landmarks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{MapError, MapLimits};
    use std::sync::atomic::AtomicUsize;

    fn shared() -> Arc<SharedState> {
        SharedState::new(Map::new("test", 0.0, MapLimits::default()), SlamConfig::default())
    }

    #[test]
    fn test_commit_publishes_only_on_success() {
        let shared = shared();
        let before = shared.snapshot();
        let epoch = shared.epoch();

        let failed: Option<Result<(), MapError>> = shared.try_commit(epoch, |map| {
            map.set_limits(MapLimits {
                max_keyframes: 7,
                ..MapLimits::default()
            });
            Err(MapError::InvariantViolation("test".into()))
        });
        assert!(matches!(failed, Some(Err(_))));
        assert!(Arc::ptr_eq(&before, &shared.snapshot()));

        let ok: Option<Result<u64, MapError>> = shared.try_commit(epoch, |map| {
            map.set_limits(MapLimits {
                max_keyframes: 7,
                ..MapLimits::default()
            });
            Ok(map.version())
        });
        assert!(matches!(ok, Some(Ok(_))));
        assert_eq!(shared.snapshot().limits().max_keyframes, 7);
        // Readers holding the old snapshot are unaffected.
        assert_eq!(before.limits().max_keyframes, MapLimits::default().max_keyframes);
    }

    #[test]
    fn test_stale_epoch_is_rejected() {
        let shared = shared();
        let epoch = shared.epoch();
        shared.replace_map(Map::new("other", 1.0, MapLimits::default()));
        assert_eq!(shared.epoch(), epoch + 1);
        let out: Option<Result<(), MapError>> = shared.try_commit(epoch, |_| Ok(()));
        assert!(out.is_none());
        assert_eq!(shared.snapshot().id(), "other");
    }

    #[test]
    fn test_state_transitions_fire_callback() {
        let shared = shared();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        shared.with_callbacks(|cb| {
            cb.on_state_change = Some(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        });

        assert!(shared.set_state(SystemState::Initializing));
        assert!(shared.set_state(SystemState::Ready));
        assert!(!shared.set_state(SystemState::Ready));
        assert!(!shared.set_state(SystemState::Relocalization));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        shared.fail("worker died");
        assert!(shared.is_failed());
        assert_eq!(shared.failure().as_deref(), Some("worker died"));
        assert!(!shared.set_state(SystemState::Ready));
    }
}
