//! Deferred Engine - frame synchronization and deferred pipeline orchestration
//!
//! The crate implements the scheduling and data-ownership core of a deferred
//! renderer:
//! - Triple-buffered hand-off of per-frame scene snapshots between the
//!   simulation/extraction thread and the GPU-bound render thread
//! - Typed per-frame slots so independent extensions attach their own
//!   payloads to the frame snapshot
//! - A multi-pass deferred pipeline composing priority-ordered render
//!   extensions over a shared set of render targets
//! - Dual opaque-geometry submission: a CPU-filtered direct path plus a
//!   GPU-culled compacted indirect path
//! - GPU-fence-gated reuse of consumed frame snapshots
//!
//! The crate never issues graphics API calls directly; all GPU work goes
//! through the [`GraphicsBackend`] trait and its stable handles, so the
//! scheduling contracts hold for any backend.
//!
//! # Wiring
//!
//! ```ignore
//! // Startup: register slots, seal, allocate the three frames.
//! let mut slots = SlotRegistry::new();
//! let geometry_token = slots.register(GeometryFrameData::default);
//! let slots = Arc::new(slots);
//! let buffer = Arc::new(FrameState::allocate_buffered(Arc::clone(&slots)));
//!
//! // Render side.
//! let targets = RenderTargetSet::new(&mut backend, config.width, config.height)?;
//! let extensions = ExtensionRegistry::builder().add(my_extension).build();
//! let orchestrator = PipelineOrchestrator::new(
//!     &mut backend, &targets, Arc::clone(&extensions), geometry_token,
//!     OrchestratorOptions::default(),
//! )?;
//! let mut driver = FrameDriver::new(Box::new(backend), targets,
//!     Arc::clone(&buffer), Arc::clone(&gate), &config);
//! driver.add_system(Box::new(orchestrator));
//!
//! // Simulation side.
//! let mut tick = TickDriver::new(buffer, extensions, scene, gate,
//!     config.force_single_threaded);
//! tick.add_extractor(Box::new(geometry_extractor));
//!
//! // Per tick / per frame, on their own threads:
//! tick.tick(delta_seconds)?;
//! driver.run_frame();
//! ```

pub mod backend;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod extension;
pub mod extract;
pub mod frame;
pub mod pipeline;
pub mod scene;
pub mod targets;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use backend::{DummyBackend, GraphicsBackend};
pub use dispatch::{render_thread_channel, GpuWorkQueue, RenderThreadDispatcher};
pub use driver::{FrameDriver, RenderSystem};
pub use error::{RenderError, RenderResult};
pub use extension::{ExtensionRegistry, ExtensionRegistryBuilder, PassContext, RenderExtension};
pub use extract::{Extractor, RenderGate, TickDriver};
pub use frame::{FrameFence, FrameState, SlotRegistry, SlotToken, TripleBuffer};
pub use pipeline::{
    GeometryExtractor, GeometryFrameData, OrchestratorOptions, PipelineOrchestrator, PostProcess,
};
pub use scene::Scene;
pub use targets::{RenderTargetSet, SharedTarget};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the frame pipeline.
///
/// All debug toggles are explicit fields here rather than process-wide
/// globals, so independent pipelines stay independently configurable.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Viewport width; fixes the render target sizes at construction.
    pub width: u32,
    /// Viewport height; fixes the render target sizes at construction.
    pub height: u32,
    /// Allow the GPU-culled indirect geometry path where supported.
    pub enable_indirect_rendering: bool,
    /// Debug: the simulation tick spin-waits for the prior render call.
    pub force_single_threaded: bool,
    /// Run the optional post-processing stage.
    pub enable_post_processing: bool,
    /// Debug: poll the driver status after every pipeline phase and frame.
    pub validate_driver_calls: bool,
    /// Debug: pause non-steppable systems until a step is requested.
    pub single_step: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            enable_indirect_rendering: true,
            force_single_threaded: false,
            enable_post_processing: true,
            validate_driver_calls: false,
            single_step: false,
        }
    }
}

impl RendererConfig {
    /// Reject invalid parameters eagerly, before any GPU resource exists.
    pub fn validate(&self) -> RenderResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "viewport must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}
