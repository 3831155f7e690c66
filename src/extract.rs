//! Simulation-side extraction loop.
//!
//! Each tick, the [`TickDriver`] stamps the write-role frame, runs every
//! registered [`Extractor`] in registration order, gives the enabled render
//! extensions their `extract`/`update` hooks, and only then publishes the
//! frame. A failed extraction aborts the tick before publishing, so a
//! corrupt snapshot never becomes visible to the render thread.

use crate::error::{RenderError, RenderResult};
use crate::extension::ExtensionRegistry;
use crate::frame::{FrameState, TripleBuffer};
use crate::scene::Scene;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-tick writer populating the write-role frame from simulation data.
///
/// Extractors capture their own data sources; they run synchronously in
/// registration order, strictly before the tick's publish.
pub trait Extractor: Send {
    fn name(&self) -> &str;

    fn extract(&mut self, frame: &mut FrameState) -> RenderResult<()>;
}

/// Shared progress counter between the two threads.
///
/// Only consulted when `force_single_threaded` is set: the simulation tick
/// then spin-waits until the prior render call has returned.
pub struct RenderGate {
    rendered: AtomicU64,
}

impl RenderGate {
    pub fn new() -> Self {
        Self {
            rendered: AtomicU64::new(0),
        }
    }

    /// Frames the render thread has finished (presented or aborted).
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Acquire)
    }

    /// Called by the frame driver after every frame attempt, including
    /// aborted ones — otherwise a throwing frame would deadlock a
    /// single-threaded simulation.
    pub fn mark_rendered(&self) {
        self.rendered.fetch_add(1, Ordering::Release);
    }

    fn wait_rendered(&self, target: u64) {
        while self.rendered.load(Ordering::Acquire) < target {
            std::thread::yield_now();
        }
    }
}

impl Default for RenderGate {
    fn default() -> Self {
        Self::new()
    }
}

/// The simulation-side per-tick loop.
pub struct TickDriver {
    buffer: Arc<TripleBuffer<FrameState>>,
    extractors: Vec<Box<dyn Extractor>>,
    extensions: Arc<ExtensionRegistry>,
    scene: Arc<RwLock<Scene>>,
    gate: Arc<RenderGate>,
    force_single_threaded: bool,
    cycle: u64,
    time: f64,
    published: u64,
}

impl TickDriver {
    pub fn new(
        buffer: Arc<TripleBuffer<FrameState>>,
        extensions: Arc<ExtensionRegistry>,
        scene: Arc<RwLock<Scene>>,
        gate: Arc<RenderGate>,
        force_single_threaded: bool,
    ) -> Self {
        Self {
            buffer,
            extractors: Vec::new(),
            extensions,
            scene,
            gate,
            force_single_threaded,
            cycle: 0,
            time: 0.0,
            published: 0,
        }
    }

    /// Register an extractor. Extractors run in registration order.
    pub fn add_extractor(&mut self, extractor: Box<dyn Extractor>) {
        log::debug!("extractor '{}' registered", extractor.name());
        self.extractors.push(extractor);
    }

    /// Number of published frames.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Run one simulation tick: extract into the write-role frame, then
    /// publish it.
    ///
    /// On error the frame is not published and the next tick reuses the
    /// same write slot with a fresh cycle.
    pub fn tick(&mut self, delta_seconds: f32) -> RenderResult<()> {
        if self.force_single_threaded && self.published > 0 {
            // Lock-step with the renderer: wait for the prior frame's
            // render call to return before starting the next tick.
            self.gate.wait_rendered(self.published);
        }

        {
            let mut frame = self.buffer.write();

            // Fence gate: this instance may have been consumed by a render
            // whose GPU work is still in flight. Do not rewrite it until
            // its fence reports signaled.
            if let Some(fence) = frame.fence().cloned() {
                fence.wait();
                frame.clear_fence();
            }

            self.cycle += 1;
            self.time += f64::from(delta_seconds);
            frame.begin(self.cycle, self.time, delta_seconds);

            for extractor in &mut self.extractors {
                extractor.extract(&mut frame).map_err(|e| match e {
                    already @ RenderError::Extraction { .. } => already,
                    other => RenderError::Extraction {
                        extractor: extractor.name().to_string(),
                        message: other.to_string(),
                    },
                })?;
            }

            let scene = self.scene.read();
            self.extensions
                .for_each_enabled(|ext| ext.extract(&mut frame, &scene))?;
            self.extensions.for_each_enabled(|ext| {
                ext.update(delta_seconds);
                Ok(())
            })?;
        }

        self.buffer.publish();
        self.published += 1;
        log::trace!("tick {} published", self.cycle);
        Ok(())
    }
}
