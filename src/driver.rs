//! The per-frame render loop.
//!
//! [`FrameDriver`] owns the backend, the render target set, and the render
//! systems. Each frame it drains marshaled GPU work, acquires the newest
//! read-role frame (or re-renders the previous one), runs the active
//! systems grouped by shared render target, presents, creates a fence for
//! the consumed frame, and reaps previously-signaled fences.
//!
//! The outermost per-frame call never lets an error escape: a failed frame
//! is logged with context and simply not presented; the loop proceeds with
//! the next tick's data.

use crate::backend::GraphicsBackend;
use crate::dispatch::GpuWorkQueue;
use crate::error::{RenderError, RenderResult};
use crate::extension::PassContext;
use crate::extract::RenderGate;
use crate::frame::{FrameFence, FrameState, TripleBuffer};
use crate::targets::{RenderTargetSet, SharedTarget};
use crate::RendererConfig;
use std::sync::Arc;

/// A renderable unit driven once per frame.
///
/// Broader than a render extension: a system may own a whole sub-pipeline
/// (the deferred orchestrator is one). Systems naming the same
/// [`shared_target`](Self::shared_target) are grouped so the target is
/// bound and cleared once per group.
pub trait RenderSystem: Send {
    fn name(&self) -> &str;

    /// Simulation-side hook; systems needing per-tick data register an
    /// [`Extractor`](crate::extract::Extractor) capturing their state.
    fn extract(&mut self, _frame: &mut FrameState) {}

    /// Once per tick, internal bookkeeping.
    fn update(&mut self, _delta_seconds: f32) {}

    fn render(&mut self, ctx: &mut PassContext) -> RenderResult<()>;

    /// Target this system draws into, if it shares one with siblings.
    /// `None` means the system binds its own destinations.
    fn shared_target(&self) -> Option<SharedTarget> {
        None
    }

    /// Whether the shared target must be cleared before this system runs.
    fn requires_clear(&self) -> bool {
        false
    }

    /// Whether this system still runs while paused in single-step mode.
    fn steppable(&self) -> bool {
        true
    }

    fn after_frame_finished(&mut self) {}
}

struct SystemEntry {
    system: Box<dyn RenderSystem>,
    enabled: bool,
    name: String,
}

/// Top-level per-frame control loop on the render thread.
pub struct FrameDriver {
    buffer: Arc<TripleBuffer<FrameState>>,
    backend: Box<dyn GraphicsBackend>,
    targets: RenderTargetSet,
    systems: Vec<SystemEntry>,
    pending_fences: Vec<FrameFence>,
    work_queue: Option<GpuWorkQueue>,
    gate: Arc<RenderGate>,
    validate_driver_calls: bool,
    single_step: bool,
    step_requested: bool,
    frames: u64,
}

impl FrameDriver {
    pub fn new(
        backend: Box<dyn GraphicsBackend>,
        targets: RenderTargetSet,
        buffer: Arc<TripleBuffer<FrameState>>,
        gate: Arc<RenderGate>,
        config: &RendererConfig,
    ) -> Self {
        Self {
            buffer,
            backend,
            targets,
            systems: Vec::new(),
            pending_fences: Vec::new(),
            work_queue: None,
            gate,
            validate_driver_calls: config.validate_driver_calls,
            single_step: config.single_step,
            step_requested: false,
            frames: 0,
        }
    }

    /// Register a render system; systems run in registration order within
    /// their target groups.
    pub fn add_system(&mut self, system: Box<dyn RenderSystem>) {
        let name = system.name().to_string();
        log::debug!("render system '{name}' registered");
        self.systems.push(SystemEntry {
            system,
            enabled: true,
            name,
        });
    }

    /// Enable or disable a system by name. Returns `false` if unknown.
    pub fn set_system_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.systems.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Attach the receiving end of the render-thread work channel.
    pub fn attach_work_queue(&mut self, queue: GpuWorkQueue) {
        self.work_queue = Some(queue);
    }

    /// Toggle single-step debug mode at runtime.
    pub fn set_single_step(&mut self, single_step: bool) {
        self.single_step = single_step;
    }

    /// In single-step mode, let every system run for exactly one frame.
    pub fn request_step(&mut self) {
        self.step_requested = true;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Fences created but not yet observed signaled.
    pub fn pending_fence_count(&self) -> usize {
        self.pending_fences.len()
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_mut()
    }

    pub fn targets(&self) -> &RenderTargetSet {
        &self.targets
    }

    /// Run one frame. Errors are logged and absorbed here; the loop always
    /// continues.
    pub fn run_frame(&mut self) {
        let frame_number = self.frames;
        if let Err(e) = self.frame_inner() {
            log::error!("frame {frame_number} aborted: {e}");
        }
        self.frames += 1;
        // Advance the gate even for aborted frames, or a single-threaded
        // simulation would wait forever on a throwing frame.
        self.gate.mark_rendered();
    }

    fn frame_inner(&mut self) -> RenderResult<()> {
        if let Some(queue) = &self.work_queue {
            queue.drain(self.backend.as_mut());
        }

        let step = std::mem::take(&mut self.step_requested);
        let single_step = self.single_step;

        // Active subset: enabled, and in single-step mode only steppable
        // systems unless a step was explicitly requested.
        let active: Vec<usize> = self
            .systems
            .iter()
            .enumerate()
            .filter(|(_, e)| e.enabled && (!single_step || step || e.system.steppable()))
            .map(|(i, _)| i)
            .collect();

        let frame = self
            .buffer
            .acquire_read(|staging, read| staging.cycle() > read.cycle());
        log::trace!("frame {} renders cycle {}", self.frames, frame.cycle());

        self.backend.begin_frame()?;

        let backend = self.backend.as_mut();
        let targets = &self.targets;
        let systems = &mut self.systems;

        // Group consecutive systems by shared target to batch bind/clear.
        let mut i = 0;
        while i < active.len() {
            let target = systems[active[i]].system.shared_target();
            let mut j = i + 1;
            while j < active.len() && systems[active[j]].system.shared_target() == target {
                j += 1;
            }

            if let Some(target) = target {
                let clear = active[i..j]
                    .iter()
                    .any(|&k| systems[k].system.requires_clear());
                targets.bind(&mut *backend, target, clear);
            }

            let mut group_result = Ok(());
            for &k in &active[i..j] {
                let mut ctx = PassContext {
                    frame: &frame,
                    backend: &mut *backend,
                    targets,
                };
                if let Err(e) = systems[k].system.render(&mut ctx) {
                    group_result = Err(e);
                    break;
                }
            }

            if target.is_some() {
                backend.end_render_pass();
            }
            group_result?;

            i = j;
        }

        // Present.
        self.backend.end_frame()?;

        if self.validate_driver_calls {
            self.backend.driver_status().map_err(RenderError::Driver)?;
        }

        // Gate reuse of the consumed read state on actual GPU completion.
        let fence = self.backend.create_fence();
        let mut frame = frame;
        frame.set_fence(fence.clone());
        self.pending_fences.push(fence);
        drop(frame);

        // Reap: poll fires each fence's completion callback exactly once.
        self.pending_fences.retain(|fence| !fence.poll());

        for &k in &active {
            self.systems[k].system.after_frame_finished();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::frame::SlotRegistry;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    type CallLog = Arc<Mutex<Vec<String>>>;

    struct TestSystem {
        name: String,
        log: CallLog,
        target: Option<SharedTarget>,
        clear: bool,
        steppable: bool,
        fail: bool,
    }

    impl TestSystem {
        fn new(name: &str, log: CallLog) -> Self {
            Self {
                name: name.to_string(),
                log,
                target: None,
                clear: false,
                steppable: true,
                fail: false,
            }
        }

        fn with_target(mut self, target: SharedTarget, clear: bool) -> Self {
            self.target = Some(target);
            self.clear = clear;
            self
        }
    }

    impl RenderSystem for TestSystem {
        fn name(&self) -> &str {
            &self.name
        }

        fn render(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.log.lock().push(format!("render:{}", self.name));
            if self.fail {
                return Err(RenderError::InvalidParameter("fail".to_string()));
            }
            Ok(())
        }

        fn shared_target(&self) -> Option<SharedTarget> {
            self.target
        }

        fn requires_clear(&self) -> bool {
            self.clear
        }

        fn steppable(&self) -> bool {
            self.steppable
        }

        fn after_frame_finished(&mut self) {
            self.log.lock().push(format!("finished:{}", self.name));
        }
    }

    fn driver() -> FrameDriver {
        let mut backend = DummyBackend::new();
        let targets = RenderTargetSet::new(&mut backend, 320, 180).unwrap();
        let registry = Arc::new(SlotRegistry::new());
        let buffer = Arc::new(FrameState::allocate_buffered(registry));
        FrameDriver::new(
            Box::new(backend),
            targets,
            buffer,
            Arc::new(RenderGate::new()),
            &RendererConfig::default(),
        )
    }

    fn dummy_commands(driver: &FrameDriver) -> Vec<String> {
        let dummy = driver
            .backend()
            .as_any()
            .downcast_ref::<DummyBackend>()
            .unwrap();
        dummy.commands().to_vec()
    }

    fn dummy_mut(driver: &mut FrameDriver) -> &mut DummyBackend {
        driver
            .backend_mut()
            .as_any_mut()
            .downcast_mut::<DummyBackend>()
            .unwrap()
    }

    #[test]
    fn test_systems_sharing_target_bound_once() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut driver = driver();
        driver.add_system(Box::new(
            TestSystem::new("fog", Arc::clone(&log)).with_target(SharedTarget::Forward, true),
        ));
        driver.add_system(Box::new(
            TestSystem::new("particles", Arc::clone(&log))
                .with_target(SharedTarget::Forward, false),
        ));

        driver.run_frame();

        let commands = dummy_commands(&driver);
        let forward_binds = commands
            .iter()
            .filter(|c| c.starts_with("begin_render_pass forward"))
            .count();
        assert_eq!(forward_binds, 1, "shared target bound once for the group");

        let calls = log.lock().clone();
        assert_eq!(
            calls,
            vec![
                "render:fog",
                "render:particles",
                "finished:fog",
                "finished:particles"
            ]
        );
    }

    #[test]
    fn test_disabled_system_skipped() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut driver = driver();
        driver.add_system(Box::new(TestSystem::new("kept", Arc::clone(&log))));
        driver.add_system(Box::new(TestSystem::new("dropped", Arc::clone(&log))));
        assert!(driver.set_system_enabled("dropped", false));
        assert!(!driver.set_system_enabled("unknown", false));

        driver.run_frame();

        let calls = log.lock().clone();
        assert!(calls.contains(&"render:kept".to_string()));
        assert!(!calls.iter().any(|c| c.contains("dropped")));
    }

    #[test]
    fn test_single_step_excludes_nonsteppable_until_requested() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut driver = driver();
        let mut paused = TestSystem::new("sim_view", Arc::clone(&log));
        paused.steppable = false;
        driver.add_system(Box::new(paused));
        driver.add_system(Box::new(TestSystem::new("hud", Arc::clone(&log))));
        driver.set_single_step(true);

        driver.run_frame();
        assert!(!log.lock().iter().any(|c| c.contains("sim_view")));

        log.lock().clear();
        driver.request_step();
        driver.run_frame();
        assert!(log.lock().iter().any(|c| c == "render:sim_view"));

        // The step is consumed; the next frame pauses again.
        log.lock().clear();
        driver.run_frame();
        assert!(!log.lock().iter().any(|c| c.contains("sim_view")));
    }

    #[test]
    fn test_failed_frame_logged_and_loop_continues() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut driver = driver();
        let mut failing = TestSystem::new("broken", Arc::clone(&log));
        failing.fail = true;
        driver.add_system(Box::new(failing));

        driver.run_frame();
        driver.run_frame();

        assert_eq!(driver.frames(), 2);
        assert_eq!(driver.gate.rendered(), 2);
        // after_frame_finished never ran for the aborted frames.
        assert!(!log.lock().iter().any(|c| c.starts_with("finished:")));
    }

    #[test]
    fn test_fence_created_reaped_and_callback_fired() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut driver = driver();
        driver.add_system(Box::new(TestSystem::new("sys", Arc::clone(&log))));

        let fired = Arc::new(AtomicU32::new(0));

        // First frame: the dummy backend signals fences immediately, and the
        // reaper observes them on the same frame.
        driver.run_frame();
        assert_eq!(driver.pending_fence_count(), 0);

        // Attach a callback to a fence we control by holding fences pending.
        dummy_mut(&mut driver).hold_fences();

        driver.run_frame();
        assert_eq!(driver.pending_fence_count(), 1);
        {
            let fired = Arc::clone(&fired);
            driver.pending_fences[0].on_signaled(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Still pending: nothing fires.
        driver.run_frame();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Signal, then the next reap fires the callback and releases it.
        dummy_mut(&mut driver).signal_pending_fences();
        driver.run_frame();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
