//! Dummy GPU backend for testing and development.
//!
//! Performs no actual GPU work; every call is recorded as a readable
//! command line so tests can assert on submission order, and fences can be
//! signaled on demand to simulate GPU completion without hardware.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::frame::FrameFence;

/// Dummy GPU backend recording all submitted commands.
pub struct DummyBackend {
    commands: Vec<String>,
    next_handle: u64,
    width: u32,
    height: u32,
    supports_indirect: bool,
    /// When `true` (the default) fences signal at creation, as if the GPU
    /// were infinitely fast. Disable to hold fences pending.
    auto_signal_fences: bool,
    pending_fences: Vec<FrameFence>,
    driver_fault: Option<String>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::with_size(1280, 720)
    }

    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            commands: Vec::new(),
            next_handle: 1,
            width,
            height,
            supports_indirect: true,
            auto_signal_fences: true,
            pending_fences: Vec::new(),
            driver_fault: None,
        }
    }

    pub fn name(&self) -> &'static str {
        "Dummy"
    }

    /// Recorded commands, oldest first.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn set_supports_indirect(&mut self, value: bool) {
        self.supports_indirect = value;
    }

    /// Hold created fences pending until [`signal_pending_fences`] is
    /// called, simulating a busy GPU.
    ///
    /// [`signal_pending_fences`]: Self::signal_pending_fences
    pub fn hold_fences(&mut self) {
        self.auto_signal_fences = false;
    }

    /// Signal every fence created while fences were held.
    pub fn signal_pending_fences(&mut self) {
        for fence in self.pending_fences.drain(..) {
            fence.signal();
        }
    }

    /// Make `driver_status` report the given fault.
    pub fn inject_driver_fault(&mut self, message: impl Into<String>) {
        self.driver_fault = Some(message.into());
    }

    pub fn clear_driver_fault(&mut self) {
        self.driver_fault = None;
    }

    fn record(&mut self, command: String) {
        log::trace!("DummyBackend: {command}");
        self.commands.push(command);
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for DummyBackend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        self.record("begin_frame".to_string());
        Ok(FrameContext {
            swapchain_view: TextureViewHandle(0),
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.record("end_frame".to_string());
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8Unorm
    }

    fn supports_multi_draw_indirect(&self) -> bool {
        self.supports_indirect
    }

    fn driver_status(&self) -> Result<(), String> {
        match &self.driver_fault {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let h = self.handle();
        self.record(format!(
            "create_buffer {} size={}",
            desc.label.as_deref().unwrap_or("?"),
            desc.size
        ));
        Ok(BufferHandle(h))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let h = self.handle();
        self.record(format!(
            "create_buffer_init {} bytes={}",
            desc.label.as_deref().unwrap_or("?"),
            data.len()
        ));
        Ok(BufferHandle(h))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.record(format!(
            "write_buffer #{} offset={} bytes={}",
            buffer.0,
            offset,
            data.len()
        ));
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let h = self.handle();
        self.record(format!(
            "create_texture {} {}x{} {:?}",
            desc.label.as_deref().unwrap_or("?"),
            desc.width,
            desc.height,
            desc.format
        ));
        Ok(TextureHandle(h))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let h = self.handle();
        self.record(format!("create_texture_view of #{}", texture.0));
        Ok(TextureViewHandle(h))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let h = self.handle();
        self.record(format!(
            "create_sampler {}",
            desc.label.as_deref().unwrap_or("?")
        ));
        Ok(SamplerHandle(h))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let h = self.handle();
        self.record(format!("create_bind_group_layout entries={}", entries.len()));
        Ok(BindGroupLayoutHandle(h))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let h = self.handle();
        self.record(format!(
            "create_bind_group layout=#{} entries={}",
            layout.0,
            entries.len()
        ));
        Ok(BindGroupHandle(h))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let h = self.handle();
        self.record(format!(
            "create_render_pipeline {}",
            desc.label.as_deref().unwrap_or("?")
        ));
        Ok(RenderPipelineHandle(h))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let h = self.handle();
        self.record(format!(
            "create_compute_pipeline {}",
            desc.label.as_deref().unwrap_or("?")
        ));
        Ok(ComputePipelineHandle(h))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.record(format!(
            "begin_render_pass {} colors={} depth={}",
            desc.label.as_deref().unwrap_or("?"),
            desc.color_attachments.len(),
            desc.depth_stencil_attachment.is_some()
        ));
    }

    fn end_render_pass(&mut self) {
        self.record("end_render_pass".to_string());
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.record(format!("begin_compute_pass {}", label.unwrap_or("?")));
    }

    fn end_compute_pass(&mut self) {
        self.record("end_compute_pass".to_string());
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(format!("set_render_pipeline #{}", pipeline.0));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record(format!("set_compute_pipeline #{}", pipeline.0));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record(format!("set_bind_group {} #{}", index, bind_group.0));
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record(format!("set_vertex_buffer {} #{} offset={}", slot, buffer.0, offset));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(format!(
            "set_index_buffer #{} offset={} {:?}",
            buffer.0, offset, format
        ));
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.record(format!("set_viewport {x} {y} {width} {height}"));
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        self.record(format!("draw {vertices:?} {instances:?}"));
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        self.record(format!("draw_indexed {indices:?} base={base_vertex} {instances:?}"));
    }

    fn multi_draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, max_draws: u32) {
        self.record(format!(
            "multi_draw_indexed_indirect #{} offset={} max_draws={}",
            buffer.0, offset, max_draws
        ));
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record(format!("dispatch_compute {x} {y} {z}"));
    }

    fn create_fence(&mut self) -> FrameFence {
        self.record("create_fence".to_string());
        if self.auto_signal_fences {
            FrameFence::new_signaled()
        } else {
            let fence = FrameFence::new_unsignaled();
            self.pending_fences.push(fence.clone());
            fence
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.record(format!("destroy_buffer #{}", buffer.0));
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.record(format!("destroy_texture #{}", texture.0));
    }
}
