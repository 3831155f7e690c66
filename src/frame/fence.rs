//! GPU completion fences.
//!
//! A [`FrameFence`] is created for every consumed read-role frame and is
//! signaled by the backend once all GPU work submitted before its creation
//! has finished. Fences close the race that CPU-side triple buffering alone
//! cannot: GPU-visible sub-resources written during extraction (e.g.
//! persistently-mapped buffers) must not be rewritten until the GPU has
//! actually finished reading them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Status of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence has not yet been signaled.
    Unsignaled,
    /// The fence has been signaled (GPU work complete).
    Signaled,
}

/// Callback fired when a fence's signal is first observed.
pub type FenceCallback = Box<dyn FnOnce() + Send>;

struct FenceInner {
    signaled: AtomicBool,
    /// Set once the callback has been fired; the callback runs at most once.
    observed: AtomicBool,
    callback: Mutex<Option<FenceCallback>>,
}

/// CPU-pollable GPU completion marker.
///
/// Transitions Unsignaled → Signaled exactly once. Clones share state, so a
/// backend can keep one clone to signal while the frame driver keeps another
/// to poll.
#[derive(Clone)]
pub struct FrameFence {
    inner: Arc<FenceInner>,
}

impl FrameFence {
    /// Create a new fence in the unsignaled state.
    pub fn new_unsignaled() -> Self {
        Self::with_state(false)
    }

    /// Create a new fence in the signaled state.
    pub fn new_signaled() -> Self {
        Self::with_state(true)
    }

    fn with_state(signaled: bool) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                signaled: AtomicBool::new(signaled),
                observed: AtomicBool::new(false),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Check the current status of the fence.
    pub fn status(&self) -> FenceStatus {
        if self.inner.signaled.load(Ordering::Acquire) {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        }
    }

    /// Check if the fence is signaled (non-blocking, does not fire callbacks).
    pub fn is_signaled(&self) -> bool {
        self.status() == FenceStatus::Signaled
    }

    /// Attach a completion callback.
    ///
    /// The callback fires synchronously on the first *observation* of the
    /// signal — from [`poll`](Self::poll) or [`wait`](Self::wait) — not at
    /// the moment the backend signals. Replaces any previous callback.
    pub fn on_signaled(&self, callback: FenceCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    /// Poll the fence, firing the completion callback on the first observed
    /// signal. Returns `true` once signaled.
    pub fn poll(&self) -> bool {
        if !self.inner.signaled.load(Ordering::Acquire) {
            return false;
        }
        if !self.inner.observed.swap(true, Ordering::AcqRel) {
            if let Some(callback) = self.inner.callback.lock().take() {
                callback();
            }
        }
        true
    }

    /// Wait for the fence to be signaled (blocking), then fire the callback
    /// if it has not been observed yet.
    pub fn wait(&self) {
        while !self.inner.signaled.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        self.poll();
    }

    /// Wait for the fence with a timeout.
    ///
    /// Returns `true` if the fence was signaled, `false` if timeout elapsed.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        while !self.inner.signaled.load(Ordering::Acquire) {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::yield_now();
        }
        self.poll();
        true
    }

    /// Signal the fence.
    ///
    /// Real backends call this when the GPU reports completion; the dummy
    /// backend and tests call it directly.
    pub fn signal(&self) {
        self.inner.signaled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for FrameFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameFence")
            .field("status", &self.status())
            .finish()
    }
}

impl Default for FrameFence {
    fn default() -> Self {
        Self::new_unsignaled()
    }
}
