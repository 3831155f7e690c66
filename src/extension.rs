//! Pluggable render extensions and their registry.
//!
//! A [`RenderExtension`] contributes work to the fixed pass sequence of the
//! deferred pipeline. Extensions are constructed once at startup, collected
//! by an explicit [`ExtensionRegistryBuilder`], and enabled or disabled at
//! runtime through the registry. The enabled flag lives in the registry, not
//! the extension; a disabled extension is skipped in *every* phase,
//! extraction included.
//!
//! Within one pass, enabled extensions run in ascending priority order;
//! equal priorities keep their registration order.

use crate::backend::GraphicsBackend;
use crate::error::RenderResult;
use crate::frame::FrameState;
use crate::scene::Scene;
use crate::targets::RenderTargetSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a render-thread pass hook may touch.
pub struct PassContext<'a> {
    pub frame: &'a FrameState,
    pub backend: &'a mut dyn GraphicsBackend,
    pub targets: &'a RenderTargetSet,
}

/// One pluggable pass unit of the deferred pipeline.
///
/// All hooks default to no-ops, so an extension implements only the phases
/// it participates in. `extract` runs on the simulation thread and must not
/// touch GPU state; the `render_*` hooks run on the render thread and may
/// bind target channels and issue GPU work through the context.
pub trait RenderExtension: Send {
    fn name(&self) -> &str;

    /// Lower priorities run first within every pass.
    fn priority(&self) -> i32;

    /// Simulation-thread hook: copy scene data into the write-role frame.
    fn extract(&mut self, _frame: &mut FrameState, _scene: &Scene) -> RenderResult<()> {
        Ok(())
    }

    /// Once per tick, extension-internal bookkeeping.
    fn update(&mut self, _delta_seconds: f32) {}

    fn render_zero_pass(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }

    fn render_first_pass(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }

    fn render_second_pass_half(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }

    fn render_second_pass_full(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }

    fn render_editor(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
        Ok(())
    }
}

struct ExtensionEntry {
    /// Hook calls are serialized per extension; the simulation thread's
    /// `extract`/`update` and the render thread's pass hooks never overlap
    /// on the same extension.
    extension: Mutex<Box<dyn RenderExtension>>,
    enabled: AtomicBool,
    name: String,
    priority: i32,
}

/// Runtime enable/disable store over the assembled extension set.
///
/// Shared between the tick driver (extract/update) and the pipeline
/// orchestrator (render passes) behind an `Arc`.
pub struct ExtensionRegistry {
    entries: Vec<ExtensionEntry>,
    /// Entry indices in execution order: ascending priority, ties by
    /// registration order.
    order: Vec<usize>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder {
            extensions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enable or disable an extension by name. Returns `false` if no
    /// extension with that name exists.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.iter().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                log::debug!(
                    "extension '{}' {}",
                    name,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Extension names in execution order, enabled or not.
    pub fn names_in_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.entries[i].name.as_str())
            .collect()
    }

    /// Run `f` for every enabled extension in execution order, stopping at
    /// the first error.
    pub fn for_each_enabled<F>(&self, mut f: F) -> RenderResult<()>
    where
        F: FnMut(&mut dyn RenderExtension) -> RenderResult<()>,
    {
        for &index in &self.order {
            let entry = &self.entries[index];
            if !entry.enabled.load(Ordering::Acquire) {
                continue;
            }
            let mut extension = entry.extension.lock();
            f(extension.as_mut())?;
        }
        Ok(())
    }
}

/// Explicit assembly step for the extension set.
///
/// The set is fixed once built; only the enabled flags change afterwards.
pub struct ExtensionRegistryBuilder {
    extensions: Vec<Box<dyn RenderExtension>>,
}

impl ExtensionRegistryBuilder {
    pub fn add(mut self, extension: impl RenderExtension + 'static) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    pub fn add_boxed(mut self, extension: Box<dyn RenderExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn build(self) -> Arc<ExtensionRegistry> {
        let entries: Vec<ExtensionEntry> = self
            .extensions
            .into_iter()
            .map(|extension| {
                let name = extension.name().to_string();
                let priority = extension.priority();
                ExtensionEntry {
                    extension: Mutex::new(extension),
                    enabled: AtomicBool::new(true),
                    name,
                    priority,
                }
            })
            .collect();

        let mut order: Vec<usize> = (0..entries.len()).collect();
        // Stable sort keeps registration order for equal priorities.
        order.sort_by_key(|&i| entries[i].priority);

        for &i in &order {
            log::debug!(
                "extension '{}' registered at priority {}",
                entries[i].name,
                entries[i].priority
            );
        }

        Arc::new(ExtensionRegistry { entries, order })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Shared call log for ordering assertions.
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    /// Extension that records every hook invocation into a shared log.
    pub struct RecordingExtension {
        pub name: String,
        pub priority: i32,
        pub log: CallLog,
        /// Pass name in which to fail, if any.
        pub fail_in: Option<&'static str>,
    }

    impl RecordingExtension {
        pub fn new(name: &str, priority: i32, log: CallLog) -> Self {
            Self {
                name: name.to_string(),
                priority,
                log,
                fail_in: None,
            }
        }

        fn record(&self, hook: &str) -> RenderResult<()> {
            self.log.lock().push(format!("{}:{}", hook, self.name));
            if self.fail_in == Some(hook) {
                return Err(crate::error::RenderError::Pass {
                    phase: "test",
                    extension: self.name.clone(),
                    message: "injected failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl RenderExtension for RecordingExtension {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn extract(&mut self, _frame: &mut FrameState, _scene: &Scene) -> RenderResult<()> {
            self.record("extract")
        }

        fn update(&mut self, _delta_seconds: f32) {
            let _ = self.record("update");
        }

        fn render_zero_pass(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.record("zero")
        }

        fn render_first_pass(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.record("first")
        }

        fn render_second_pass_half(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.record("second_half")
        }

        fn render_second_pass_full(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.record("second_full")
        }

        fn render_editor(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
            self.record("editor")
        }
    }
}
