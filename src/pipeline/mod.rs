//! Deferred pipeline orchestration.
//!
//! [`PipelineOrchestrator`] sequences the fixed per-frame macro-pipeline:
//!
//! 1. Zero pass (per extension)
//! 2. First pass — opaque geometry, direct + optional GPU-culled indirect
//! 3. Second pass, half resolution — auxiliary effects
//! 4. Second pass, full resolution — lighting and effects
//! 5. Combine — merge G-buffer and light accumulation into the final buffer
//! 6. Optional post-process, then the present hand-off
//!
//! A phase transition happens only after every enabled extension completed
//! the current phase; no phase is skipped, though an extension may
//! individually no-op it. An error in any pass aborts the remainder of the
//! frame (fail-fast) except post-processing, which is logged and neutralized
//! so presentation still proceeds.

pub mod geometry;

pub use geometry::{
    partition_batches, BatchPartition, DrawIndexedIndirectCommand, GeometryBatch,
    GeometryExtractor, GeometryFrameData, IndirectGeometryPath, MeshBinding,
};

use std::sync::Arc;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::driver::RenderSystem;
use crate::error::{RenderError, RenderResult};
use crate::extension::{ExtensionRegistry, PassContext, RenderExtension};
use crate::frame::SlotToken;
use crate::targets::{RenderTargetSet, SharedTarget};

/// Per-frame phase state machine of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    ZeroPass,
    FirstPass,
    SecondPassHalf,
    SecondPassFull,
    Combine,
    Present,
}

impl FramePhase {
    fn name(self) -> &'static str {
        match self {
            FramePhase::Idle => "idle",
            FramePhase::ZeroPass => "zero_pass",
            FramePhase::FirstPass => "first_pass",
            FramePhase::SecondPassHalf => "second_pass_half",
            FramePhase::SecondPassFull => "second_pass_full",
            FramePhase::Combine => "combine",
            FramePhase::Present => "present",
        }
    }
}

/// The one deliberately fail-soft stage: errors are logged and swallowed so
/// the frame still presents.
pub trait PostProcess: Send {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &mut PassContext) -> RenderResult<()>;
}

/// Options fixed at orchestrator construction.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Allow the GPU-culled indirect path (still requires the capability).
    pub enable_indirect_rendering: bool,
    pub enable_post_processing: bool,
    pub validate_driver_calls: bool,
    /// Upper bound on opaque batches per frame.
    pub max_batches: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            enable_indirect_rendering: true,
            enable_post_processing: true,
            validate_driver_calls: false,
            max_batches: 4096,
        }
    }
}

/// Sequences the deferred macro-pipeline and owns geometry submission.
pub struct PipelineOrchestrator {
    extensions: Arc<ExtensionRegistry>,
    geometry_token: SlotToken<GeometryFrameData>,
    camera_buffer: BufferHandle,
    object_buffer: BufferHandle,
    geometry_pipeline: RenderPipelineHandle,
    geometry_bind_group: BindGroupHandle,
    combine_pipeline: RenderPipelineHandle,
    combine_bind_group: BindGroupHandle,
    indirect: Option<IndirectGeometryPath>,
    post_process: Option<Box<dyn PostProcess>>,
    options: OrchestratorOptions,
    phase: FramePhase,
}

impl PipelineOrchestrator {
    /// Build the orchestrator's GPU resources against an existing target set.
    ///
    /// The indirect path is set up only when configuration enables it *and*
    /// the device advertises the capability; otherwise every batch goes
    /// through the direct path.
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        targets: &RenderTargetSet,
        extensions: Arc<ExtensionRegistry>,
        geometry_token: SlotToken<GeometryFrameData>,
        options: OrchestratorOptions,
    ) -> RenderResult<Self> {
        if options.max_batches == 0 {
            return Err(RenderError::InvalidParameter(
                "max_batches must be non-zero".to_string(),
            ));
        }

        let camera_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("camera_uniforms".to_string()),
            size: std::mem::size_of::<CameraUniform>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let object_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("object_uniforms".to_string()),
            size: u64::from(options.max_batches) * std::mem::size_of::<ObjectUniform>() as u64,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let geometry_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;

        let geometry_bind_group = backend.create_bind_group(
            geometry_layout,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: camera_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: object_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;

        let gbuffer = targets.geometry();
        let geometry_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("geometry".to_string()),
            vertex_shader: GEOMETRY_SHADER.to_string(),
            fragment_shader: Some(GEOMETRY_SHADER.to_string()),
            vertex_layouts: vec![standard_vertex_layout()],
            bind_group_layouts: vec![geometry_layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: TextureFormat::Depth32Float,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: vec![
                ColorTargetState {
                    format: gbuffer.position_roughness.format,
                    blend: false,
                },
                ColorTargetState {
                    format: gbuffer.normal_ambient.format,
                    blend: false,
                },
                ColorTargetState {
                    format: gbuffer.albedo_metallic.format,
                    blend: false,
                },
                ColorTargetState {
                    format: gbuffer.motion_transparency.format,
                    blend: false,
                },
                ColorTargetState {
                    format: gbuffer.depth_index.format,
                    blend: false,
                },
            ],
        })?;

        let combine_sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("combine_sampler".to_string()),
            ..Default::default()
        })?;

        let combine_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
        ])?;

        let combine_bind_group = backend.create_bind_group(
            combine_layout,
            &[
                (0, BindGroupEntry::Texture(gbuffer.albedo_metallic.view)),
                (
                    1,
                    BindGroupEntry::Texture(targets.light_accumulation().view),
                ),
                (2, BindGroupEntry::Sampler(combine_sampler)),
            ],
        )?;

        let combine_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("combine".to_string()),
            vertex_shader: COMBINE_SHADER.to_string(),
            fragment_shader: Some(COMBINE_SHADER.to_string()),
            vertex_layouts: Vec::new(),
            bind_group_layouts: vec![combine_layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: None,
            color_targets: vec![ColorTargetState {
                format: targets.final_color().format,
                blend: false,
            }],
        })?;

        let indirect = if options.enable_indirect_rendering
            && backend.supports_multi_draw_indirect()
        {
            Some(IndirectGeometryPath::new(backend, options.max_batches)?)
        } else {
            if options.enable_indirect_rendering {
                log::info!("indirect rendering requested but not supported by the device");
            }
            None
        };

        Ok(Self {
            extensions,
            geometry_token,
            camera_buffer,
            object_buffer,
            geometry_pipeline,
            geometry_bind_group,
            combine_pipeline,
            combine_bind_group,
            indirect,
            post_process: None,
            options,
            phase: FramePhase::Idle,
        })
    }

    /// Install the optional post-process stage.
    pub fn set_post_process(&mut self, post_process: Box<dyn PostProcess>) {
        self.post_process = Some(post_process);
    }

    /// Whether the GPU-culled path is active this run.
    pub fn indirect_active(&self) -> bool {
        self.indirect.is_some()
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Run the full macro-pipeline against the read-role frame.
    pub fn run_frame(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        debug_assert_eq!(self.phase, FramePhase::Idle, "frame already in flight");

        let result = self.run_phases(ctx);
        // Whatever happened, the next frame starts from a clean slate.
        self.phase = FramePhase::Idle;
        result
    }

    fn run_phases(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        self.enter(FramePhase::ZeroPass);
        self.extensions
            .for_each_enabled(|ext| hook(ext, ctx, FramePhase::ZeroPass))?;
        self.check_driver(ctx.backend)?;

        self.enter(FramePhase::FirstPass);
        self.submit_geometry(ctx)?;
        self.extensions
            .for_each_enabled(|ext| hook(ext, ctx, FramePhase::FirstPass))?;
        self.check_driver(ctx.backend)?;

        self.enter(FramePhase::SecondPassHalf);
        self.extensions
            .for_each_enabled(|ext| hook(ext, ctx, FramePhase::SecondPassHalf))?;
        self.check_driver(ctx.backend)?;

        self.enter(FramePhase::SecondPassFull);
        self.extensions
            .for_each_enabled(|ext| hook(ext, ctx, FramePhase::SecondPassFull))?;
        self.check_driver(ctx.backend)?;

        self.enter(FramePhase::Combine);
        self.combine(ctx);
        self.extensions
            .for_each_enabled(|ext| ext.render_editor(ctx).map_err(|e| phase_error("editor", ext.name(), e)))?;
        self.check_driver(ctx.backend)?;

        if self.options.enable_post_processing {
            if let Some(post) = self.post_process.as_mut() {
                // Fail-soft: a broken post-process must not cost the frame.
                if let Err(e) = post.run(ctx) {
                    log::error!("post-process '{}' failed, skipped: {e}", post.name());
                }
            }
        }

        self.enter(FramePhase::Present);
        Ok(())
    }

    fn enter(&mut self, phase: FramePhase) {
        log::trace!("pipeline phase {} -> {}", self.phase.name(), phase.name());
        self.phase = phase;
    }

    fn check_driver(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        if !self.options.validate_driver_calls {
            return Ok(());
        }
        backend.driver_status().map_err(RenderError::Driver)
    }

    /// First-pass opaque geometry: upload uniforms, run the cull dispatch,
    /// then draw both paths into the geometry buffer.
    fn submit_geometry(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        let frame = ctx.frame;
        let data = frame.slot(self.geometry_token);

        let batch_count = data.batches.len().min(self.options.max_batches as usize);
        if (data.batches.len() as u32) > self.options.max_batches {
            log::warn!(
                "frame has {} batches, exceeding capacity {}; overflow is not drawn",
                data.batches.len(),
                self.options.max_batches
            );
        }
        let batches = &data.batches[..batch_count];

        let partition = partition_batches(batches, self.indirect.is_some());

        // Uniform uploads and the cull dispatch happen outside the render pass.
        ctx.backend
            .write_buffer(self.camera_buffer, 0, bytemuck::bytes_of(&data.camera));

        if !batches.is_empty() {
            let objects: Vec<ObjectUniform> = batches
                .iter()
                .map(|batch| ObjectUniform {
                    model: batch.model,
                    normal_matrix: batch.model.inverse().transpose(),
                })
                .collect();
            ctx.backend
                .write_buffer(self.object_buffer, 0, bytemuck::cast_slice(&objects));
        }

        let indirect_draws = match &self.indirect {
            Some(path) => path.prepare(ctx.backend, data, &partition.indirect),
            None => 0,
        };

        ctx.targets.bind(ctx.backend, SharedTarget::Geometry, true);
        ctx.backend.set_viewport(
            0.0,
            0.0,
            ctx.targets.width() as f32,
            ctx.targets.height() as f32,
        );
        ctx.backend.set_render_pipeline(self.geometry_pipeline);
        ctx.backend.set_bind_group(0, self.geometry_bind_group);

        // Direct path: CPU-filtered per-batch draws. The instance index
        // doubles as the object-buffer index.
        for &index in &partition.direct {
            let batch = &batches[index];
            ctx.backend.set_vertex_buffer(0, batch.mesh.vertex_buffer, 0);
            ctx.backend
                .set_index_buffer(batch.mesh.index_buffer, 0, IndexFormat::Uint32);
            let first = batch.mesh.first_index;
            ctx.backend.draw_indexed(
                first..first + batch.mesh.index_count,
                batch.mesh.base_vertex,
                index as u32..index as u32 + 1,
            );
        }

        // Indirect path: one compacted multi-draw over the arena.
        if indirect_draws > 0 {
            if let (Some(path), Some(arena)) = (
                &self.indirect,
                IndirectGeometryPath::arena_binding(data, &partition.indirect),
            ) {
                ctx.backend.set_vertex_buffer(0, arena.vertex_buffer, 0);
                ctx.backend
                    .set_index_buffer(arena.index_buffer, 0, IndexFormat::Uint32);
                ctx.backend
                    .multi_draw_indexed_indirect(path.command_buffer(), 0, indirect_draws);
            }
        }

        ctx.backend.end_render_pass();
        Ok(())
    }

    /// Merge the G-buffer and light accumulation into the final buffer.
    fn combine(&self, ctx: &mut PassContext) {
        ctx.targets.bind(ctx.backend, SharedTarget::FinalColor, true);
        ctx.backend.set_render_pipeline(self.combine_pipeline);
        ctx.backend.set_bind_group(0, self.combine_bind_group);
        ctx.backend.draw(0..3, 0..1);
        ctx.backend.end_render_pass();
    }
}

impl RenderSystem for PipelineOrchestrator {
    fn name(&self) -> &str {
        "deferred_pipeline"
    }

    fn render(&mut self, ctx: &mut PassContext) -> RenderResult<()> {
        self.run_frame(ctx)
    }

    // The orchestrator binds its own targets per phase.
    fn shared_target(&self) -> Option<SharedTarget> {
        None
    }
}

fn hook(
    ext: &mut dyn RenderExtension,
    ctx: &mut PassContext,
    phase: FramePhase,
) -> RenderResult<()> {
    let result = match phase {
        FramePhase::ZeroPass => ext.render_zero_pass(ctx),
        FramePhase::FirstPass => ext.render_first_pass(ctx),
        FramePhase::SecondPassHalf => ext.render_second_pass_half(ctx),
        FramePhase::SecondPassFull => ext.render_second_pass_full(ctx),
        _ => Ok(()),
    };
    result.map_err(|e| phase_error(phase.name(), ext.name(), e))
}

fn phase_error(phase: &'static str, extension: &str, err: RenderError) -> RenderError {
    match err {
        already @ RenderError::Pass { .. } => already,
        other => RenderError::Pass {
            phase,
            extension: extension.to_string(),
            message: other.to_string(),
        },
    }
}

/// Position + normal + uv + tangent, the layout every arena mesh uses.
fn standard_vertex_layout() -> VertexBufferLayout {
    VertexBufferLayout {
        array_stride: 48,
        step_mode: VertexStepMode::Vertex,
        attributes: vec![
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float32x3,
                offset: 12,
            },
            VertexAttribute {
                location: 2,
                format: VertexFormat::Float32x2,
                offset: 24,
            },
            VertexAttribute {
                location: 3,
                format: VertexFormat::Float32x4,
                offset: 32,
            },
        ],
    }
}

/// Geometry pass shader writing all five G-buffer channels.
pub const GEOMETRY_SHADER: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct ObjectUniforms {
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(0) @binding(1) var<storage, read> objects: array<ObjectUniforms>;

struct VertexInput {
    @builtin(instance_index) instance: u32,
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) @interpolate(flat) object_index: u32,
}

struct GBufferOutput {
    @location(0) position_roughness: vec4<f32>,
    @location(1) normal_ambient: vec4<f32>,
    @location(2) albedo_metallic: vec4<f32>,
    @location(3) motion_transparency: vec4<f32>,
    @location(4) depth_index: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let object = objects[in.instance];
    let world_pos = object.model * vec4<f32>(in.position, 1.0);
    out.world_position = world_pos.xyz;
    out.clip_position = camera.view_proj * world_pos;
    out.world_normal = normalize((object.normal_matrix * vec4<f32>(in.normal, 0.0)).xyz);
    out.uv = in.uv;
    out.object_index = in.instance;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> GBufferOutput {
    var out: GBufferOutput;
    let view_depth = length(camera.position.xyz - in.world_position);

    out.position_roughness = vec4<f32>(in.world_position, 0.5);
    out.normal_ambient = vec4<f32>(in.world_normal * 0.5 + 0.5, 1.0);
    out.albedo_metallic = vec4<f32>(1.0, 1.0, 1.0, 0.0);
    out.motion_transparency = vec4<f32>(0.0, 0.0, view_depth, 1.0);
    out.depth_index = vec2<f32>(view_depth, f32(in.object_index));
    return out;
}
"#;

/// Fullscreen combine: G-buffer albedo modulated by accumulated light.
pub const COMBINE_SHADER: &str = r#"
@group(0) @binding(0) var albedo_metallic: texture_2d<f32>;
@group(0) @binding(1) var light_accumulation: texture_2d<f32>;
@group(0) @binding(2) var combine_sampler: sampler;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    // Fullscreen triangle, no vertex buffer.
    var out: VertexOutput;
    let x = f32(i32(index / 2u) * 4 - 1);
    let y = f32(i32(index % 2u) * 4 - 1);
    out.clip_position = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>((x + 1.0) * 0.5, 1.0 - (y + 1.0) * 0.5);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSample(albedo_metallic, combine_sampler, in.uv);
    let light = textureSample(light_accumulation, combine_sampler, in.uv);
    return vec4<f32>(albedo.rgb * light.rgb, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::extension::test_support::{CallLog, RecordingExtension};
    use crate::frame::{FrameState, SlotRegistry};
    use crate::scene::BoundingSphere;
    use glam::{Mat4, Vec3};
    use parking_lot::Mutex;

    struct Fixture {
        backend: DummyBackend,
        targets: RenderTargetSet,
        orchestrator: PipelineOrchestrator,
        frame: FrameState,
        token: SlotToken<GeometryFrameData>,
    }

    fn fixture(extensions: Arc<ExtensionRegistry>, indirect: bool) -> Fixture {
        let mut backend = DummyBackend::new();
        backend.set_supports_indirect(indirect);

        let mut slot_registry = SlotRegistry::new();
        let token = slot_registry.register(GeometryFrameData::default);
        let slot_registry = Arc::new(slot_registry);

        let targets = RenderTargetSet::new(&mut backend, 640, 360).unwrap();
        let orchestrator = PipelineOrchestrator::new(
            &mut backend,
            &targets,
            extensions,
            token,
            OrchestratorOptions::default(),
        )
        .unwrap();

        let frame = FrameState::new(slot_registry);
        Fixture {
            backend,
            targets,
            orchestrator,
            frame,
            token,
        }
    }

    fn arena_batch(index: u64) -> GeometryBatch {
        GeometryBatch {
            object_id: index,
            mesh: MeshBinding {
                vertex_buffer: BufferHandle(900),
                index_buffer: BufferHandle(901),
                index_count: 36,
                first_index: 0,
                base_vertex: 0,
                arena_resident: true,
            },
            material_id: 1,
            model: Mat4::IDENTITY,
            bounds: Some(BoundingSphere {
                center: Vec3::ZERO,
                radius: 1.0,
            }),
        }
    }

    fn loose_batch(index: u64) -> GeometryBatch {
        let mut batch = arena_batch(index);
        batch.mesh.arena_resident = false;
        batch.mesh.vertex_buffer = BufferHandle(910 + index);
        batch
    }

    #[test]
    fn test_pass_hooks_run_in_priority_order_per_phase() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let extensions = ExtensionRegistry::builder()
            .add(RecordingExtension::new("b", 30, Arc::clone(&log)))
            .add(RecordingExtension::new("a", 10, Arc::clone(&log)))
            .build();

        let mut fx = fixture(extensions, false);
        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        fx.orchestrator.run_frame(&mut ctx).unwrap();

        let calls = log.lock().clone();
        let zero: Vec<_> = calls.iter().filter(|c| c.starts_with("zero:")).collect();
        assert_eq!(zero, vec!["zero:a", "zero:b"]);

        // Every phase completed for all extensions before the next began.
        let phases = ["zero", "first", "second_half", "second_full", "editor"];
        let mut positions = Vec::new();
        for phase in phases {
            let last = calls
                .iter()
                .rposition(|c| c.starts_with(&format!("{phase}:")))
                .unwrap();
            positions.push(last);
        }
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_failure_aborts_remaining_phases_and_recovers() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut failing = RecordingExtension::new("bad", 10, Arc::clone(&log));
        failing.fail_in = Some("first");
        let extensions = ExtensionRegistry::builder().add(failing).build();

        let mut fx = fixture(extensions, false);

        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        let err = fx.orchestrator.run_frame(&mut ctx).unwrap_err();
        assert!(matches!(err, RenderError::Pass { .. }));

        let calls = log.lock().clone();
        assert!(calls.iter().any(|c| c == "first:bad"));
        assert!(
            !calls.iter().any(|c| c.starts_with("second_half:")),
            "later passes must not run after a first-pass failure"
        );

        // The next frame starts cleanly from the zero pass.
        log.lock().clear();
        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        let _ = fx.orchestrator.run_frame(&mut ctx);
        assert_eq!(log.lock().first().map(String::as_str), Some("zero:bad"));
    }

    #[test]
    fn test_direct_and_indirect_paths_split_submission() {
        let extensions = ExtensionRegistry::builder().build();
        let mut fx = fixture(extensions, true);
        assert!(fx.orchestrator.indirect_active());

        {
            let data = fx.frame.slot_mut(fx.token);
            data.batches = vec![arena_batch(0), loose_batch(1), arena_batch(2)];
        }

        fx.backend.clear_commands();
        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        fx.orchestrator.run_frame(&mut ctx).unwrap();

        let commands = fx.backend.commands();
        let direct_draws = commands
            .iter()
            .filter(|c| c.starts_with("draw_indexed"))
            .count();
        assert_eq!(direct_draws, 1, "only the loose batch draws directly");
        assert!(commands
            .iter()
            .any(|c| c.contains("multi_draw_indexed_indirect") && c.contains("max_draws=2")));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("begin_compute_pass batch_cull")));
    }

    #[test]
    fn test_no_indirect_capability_falls_back_to_direct() {
        let extensions = ExtensionRegistry::builder().build();
        let mut fx = fixture(extensions, false);
        assert!(!fx.orchestrator.indirect_active());

        {
            let data = fx.frame.slot_mut(fx.token);
            data.batches = vec![arena_batch(0), arena_batch(1)];
        }

        fx.backend.clear_commands();
        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        fx.orchestrator.run_frame(&mut ctx).unwrap();

        let commands = fx.backend.commands();
        let direct_draws = commands
            .iter()
            .filter(|c| c.starts_with("draw_indexed"))
            .count();
        assert_eq!(direct_draws, 2);
        assert!(!commands.iter().any(|c| c.contains("multi_draw")));
    }

    #[test]
    fn test_post_process_failure_is_swallowed() {
        struct BrokenPost;
        impl PostProcess for BrokenPost {
            fn name(&self) -> &str {
                "broken"
            }
            fn run(&mut self, _ctx: &mut PassContext) -> RenderResult<()> {
                Err(RenderError::InvalidParameter("no".to_string()))
            }
        }

        let extensions = ExtensionRegistry::builder().build();
        let mut fx = fixture(extensions, false);
        fx.orchestrator.set_post_process(Box::new(BrokenPost));

        let mut ctx = PassContext {
            frame: &fx.frame,
            backend: &mut fx.backend,
            targets: &fx.targets,
        };
        // The frame still completes.
        fx.orchestrator.run_frame(&mut ctx).unwrap();
    }

    #[test]
    fn test_driver_validation_surfaces_fault() {
        let extensions = ExtensionRegistry::builder().build();
        let mut backend = DummyBackend::new();
        let mut slot_registry = SlotRegistry::new();
        let token = slot_registry.register(GeometryFrameData::default);
        let slot_registry = Arc::new(slot_registry);
        let targets = RenderTargetSet::new(&mut backend, 64, 64).unwrap();
        let mut orchestrator = PipelineOrchestrator::new(
            &mut backend,
            &targets,
            extensions,
            token,
            OrchestratorOptions {
                validate_driver_calls: true,
                ..Default::default()
            },
        )
        .unwrap();
        let frame = FrameState::new(slot_registry);

        backend.inject_driver_fault("device hung");
        let mut ctx = PassContext {
            frame: &frame,
            backend: &mut backend,
            targets: &targets,
        };
        let err = orchestrator.run_frame(&mut ctx).unwrap_err();
        assert!(matches!(err, RenderError::Driver(_)));
    }
}
