//! Per-frame state and the synchronization primitives around it.
//!
//! One [`FrameState`] is a snapshot of everything the renderer needs for a
//! single frame. Three instances exist for the lifetime of the engine and
//! rotate through Write/Staging/Read roles inside a [`TripleBuffer`]; they
//! are never destroyed, only recycled.

mod fence;
mod registry;
mod triple_buffer;

pub use fence::{FenceCallback, FenceStatus, FrameFence};
pub use registry::{SlotRegistry, SlotToken};
pub use triple_buffer::{ReadGuard, TripleBuffer, WriteGuard};

use registry::SlotValue;
use std::sync::Arc;
use std::sync::OnceLock;

/// One frame's extracted scene snapshot.
///
/// Carries the monotonic extraction cycle, timing, the lazily-created slot
/// values registered through [`SlotRegistry`], and the fence of the last
/// render that consumed this instance.
pub struct FrameState {
    cycle: u64,
    time: f64,
    delta_seconds: f32,
    registry: Arc<SlotRegistry>,
    slots: Vec<OnceLock<SlotValue>>,
    fence: Option<FrameFence>,
}

impl FrameState {
    /// Create a frame instance bound to a sealed slot registry.
    pub fn new(registry: Arc<SlotRegistry>) -> Self {
        let slots = (0..registry.len()).map(|_| OnceLock::new()).collect();
        Self {
            cycle: 0,
            time: 0.0,
            delta_seconds: 0.0,
            registry,
            slots,
            fence: None,
        }
    }

    /// Allocate the three buffered instances from one registry.
    pub fn allocate_buffered(registry: Arc<SlotRegistry>) -> TripleBuffer<FrameState> {
        TripleBuffer::new(|| FrameState::new(Arc::clone(&registry)))
    }

    /// Monotonic extraction cycle this snapshot belongs to.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Absolute simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Simulation step length for this frame.
    pub fn delta_seconds(&self) -> f32 {
        self.delta_seconds
    }

    /// Stamp the frame at the start of an extraction tick.
    ///
    /// Called by the tick driver before any extractor runs.
    pub fn begin(&mut self, cycle: u64, time: f64, delta_seconds: f32) {
        self.cycle = cycle;
        self.time = time;
        self.delta_seconds = delta_seconds;
    }

    /// Resolve a slot, lazily creating this instance's value on first access.
    ///
    /// # Panics
    ///
    /// Panics if the token was issued by a different registry.
    pub fn slot<T: Send + Sync + 'static>(&self, token: SlotToken<T>) -> &T {
        self.check_token(token.registry_id());
        let value = self.slots[token.index()]
            .get_or_init(|| self.registry.instantiate(token.index()));
        value
            .downcast_ref::<T>()
            .expect("slot value type diverged from its token")
    }

    /// Mutable variant of [`slot`](Self::slot) for the extraction side,
    /// which holds the frame exclusively.
    pub fn slot_mut<T: Send + Sync + 'static>(&mut self, token: SlotToken<T>) -> &mut T {
        self.check_token(token.registry_id());
        if self.slots[token.index()].get().is_none() {
            let value = self.registry.instantiate(token.index());
            // Cannot race: we hold &mut self.
            let _ = self.slots[token.index()].set(value);
        }
        self.slots[token.index()]
            .get_mut()
            .expect("slot initialized above")
            .downcast_mut::<T>()
            .expect("slot value type diverged from its token")
    }

    fn check_token(&self, registry_id: u64) {
        assert_eq!(
            registry_id,
            self.registry.id(),
            "slot token resolved against a frame from a different registry"
        );
    }

    /// Fence of the render that last consumed this instance, if any.
    pub fn fence(&self) -> Option<&FrameFence> {
        self.fence.as_ref()
    }

    /// Attach the fence created after this frame was consumed.
    pub fn set_fence(&mut self, fence: FrameFence) {
        self.fence = Some(fence);
    }

    /// Drop the fence once its signal has been awaited.
    pub fn clear_fence(&mut self) {
        self.fence = None;
    }

    /// Whether this instance may be safely rewritten.
    ///
    /// `false` while the GPU may still be reading sub-resources referenced
    /// by the last render of this instance.
    pub fn write_ready(&self) -> bool {
        self.fence.as_ref().map_or(true, FrameFence::is_signaled)
    }
}

impl std::fmt::Debug for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameState")
            .field("cycle", &self.cycle)
            .field("time", &self.time)
            .field("delta_seconds", &self.delta_seconds)
            .field("slots", &self.slots.len())
            .field("fence", &self.fence)
            .finish()
    }
}
