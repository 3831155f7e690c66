//! Opaque geometry submission: the direct and GPU-culled indirect paths.
//!
//! Every eligible batch is drawn by exactly one path. The indirect path,
//! when the device supports it and configuration enables it, claims batches
//! resident in the shared geometry arena and carrying bounds; the direct
//! path draws everything the indirect path did not claim. The union of both
//! is the full eligible set, the intersection is empty.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::extract::Extractor;
use crate::frame::{FrameState, SlotToken};
use crate::scene::{BoundingSphere, Scene};
use parking_lot::RwLock;

/// GPU-resident mesh binding: where a mesh's geometry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBinding {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    /// Meshes in the shared geometry arena share one vertex/index buffer
    /// pair and can be drawn through a single compacted multi-draw.
    pub arena_resident: bool,
}

/// One opaque draw extracted for the current frame.
#[derive(Debug, Clone, Copy)]
pub struct GeometryBatch {
    pub object_id: u64,
    pub mesh: MeshBinding,
    pub material_id: u64,
    pub model: Mat4,
    pub bounds: Option<BoundingSphere>,
}

impl GeometryBatch {
    /// Whether the GPU-culled indirect path may claim this batch.
    pub fn indirect_capable(&self) -> bool {
        self.mesh.arena_resident && self.bounds.is_some()
    }
}

/// Per-frame slot payload carrying the extracted opaque geometry.
#[derive(Default)]
pub struct GeometryFrameData {
    pub camera: CameraUniform,
    pub batches: Vec<GeometryBatch>,
}

impl GeometryFrameData {
    pub fn clear(&mut self) {
        self.batches.clear();
    }
}

/// Indexed-draw parameters as laid out in the indirect buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

/// Uniforms consumed by the cull compute shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CullUniforms {
    view_proj: Mat4,
    draw_count: u32,
    _padding: [u32; 3],
}

/// The split of one frame's batches between the two submission paths.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchPartition {
    /// Indices into the frame's batch list drawn by the direct path.
    pub direct: Vec<usize>,
    /// Indices claimed by the compacted indirect path.
    pub indirect: Vec<usize>,
}

/// Assign every batch to exactly one submission path.
///
/// With the indirect path inactive, the direct path owns the full set.
pub fn partition_batches(batches: &[GeometryBatch], indirect_active: bool) -> BatchPartition {
    let mut partition = BatchPartition::default();
    for (index, batch) in batches.iter().enumerate() {
        if indirect_active && batch.indirect_capable() {
            partition.indirect.push(index);
        } else {
            partition.direct.push(index);
        }
    }
    partition
}

/// GPU-culled compacted multi-draw submission.
///
/// Per frame: the CPU writes the full command and bounds arrays, a compute
/// dispatch zeroes the instance count of every batch outside the frustum,
/// and one `multi_draw_indexed_indirect` consumes the compacted buffer.
#[derive(Debug)]
pub struct IndirectGeometryPath {
    command_buffer: BufferHandle,
    bounds_buffer: BufferHandle,
    cull_uniforms: BufferHandle,
    cull_pipeline: ComputePipelineHandle,
    cull_bind_group: BindGroupHandle,
    capacity: u32,
}

impl IndirectGeometryPath {
    pub fn new(backend: &mut dyn GraphicsBackend, capacity: u32) -> RenderResult<Self> {
        if capacity == 0 {
            return Err(RenderError::InvalidParameter(
                "indirect path capacity must be non-zero".to_string(),
            ));
        }

        let command_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("indirect_commands".to_string()),
            size: u64::from(capacity) * std::mem::size_of::<DrawIndexedIndirectCommand>() as u64,
            usage: BufferUsage::STORAGE | BufferUsage::INDIRECT | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let bounds_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("indirect_bounds".to_string()),
            size: u64::from(capacity) * 16,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let cull_uniforms = backend.create_buffer(&BufferDescriptor {
            label: Some("cull_uniforms".to_string()),
            size: std::mem::size_of::<CullUniforms>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::UniformBuffer,
            },
        ])?;

        let cull_pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("batch_cull".to_string()),
            shader: CULL_SHADER.to_string(),
            entry_point: "cull_batches".to_string(),
            bind_group_layouts: vec![layout],
        })?;

        let cull_bind_group = backend.create_bind_group(
            layout,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: command_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: bounds_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: cull_uniforms,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;

        Ok(Self {
            command_buffer,
            bounds_buffer,
            cull_uniforms,
            cull_pipeline,
            cull_bind_group,
            capacity,
        })
    }

    pub fn command_buffer(&self) -> BufferHandle {
        self.command_buffer
    }

    /// Upload this frame's commands and run the cull dispatch.
    ///
    /// Must be called outside any render pass. Returns the number of
    /// commands in the buffer, which is the `max_draws` for the subsequent
    /// multi-draw.
    pub fn prepare(
        &self,
        backend: &mut dyn GraphicsBackend,
        data: &GeometryFrameData,
        indices: &[usize],
    ) -> u32 {
        let mut commands = Vec::with_capacity(indices.len());
        let mut bounds = Vec::with_capacity(indices.len());

        for &index in indices {
            let batch = &data.batches[index];
            if commands.len() as u32 == self.capacity {
                log::warn!(
                    "indirect path capacity {} exceeded, {} batches fall back unsubmitted",
                    self.capacity,
                    indices.len() - commands.len()
                );
                break;
            }
            let sphere = match batch.bounds {
                Some(sphere) => sphere,
                // Filtered out by partitioning already.
                None => continue,
            };
            commands.push(DrawIndexedIndirectCommand {
                index_count: batch.mesh.index_count,
                instance_count: 1,
                first_index: batch.mesh.first_index,
                base_vertex: batch.mesh.base_vertex,
                first_instance: index as u32,
            });
            bounds.push([
                sphere.center.x,
                sphere.center.y,
                sphere.center.z,
                sphere.radius,
            ]);
        }

        let draw_count = commands.len() as u32;
        if draw_count == 0 {
            return 0;
        }

        backend.write_buffer(self.command_buffer, 0, bytemuck::cast_slice(&commands));
        backend.write_buffer(self.bounds_buffer, 0, bytemuck::cast_slice(&bounds));
        backend.write_buffer(
            self.cull_uniforms,
            0,
            bytemuck::bytes_of(&CullUniforms {
                view_proj: data.camera.view_proj,
                draw_count,
                _padding: [0; 3],
            }),
        );

        backend.begin_compute_pass(Some("batch_cull"));
        backend.set_compute_pipeline(self.cull_pipeline);
        backend.set_bind_group(0, self.cull_bind_group);
        backend.dispatch_compute(draw_count.div_ceil(64), 1, 1);
        backend.end_compute_pass();

        draw_count
    }

    /// The arena buffers shared by all claimed batches.
    pub fn arena_binding(data: &GeometryFrameData, indices: &[usize]) -> Option<MeshBinding> {
        let first = data.batches[*indices.first()?].mesh;
        debug_assert!(
            indices
                .iter()
                .all(|&i| data.batches[i].mesh.vertex_buffer == first.vertex_buffer
                    && data.batches[i].mesh.index_buffer == first.index_buffer),
            "indirect batches must share the geometry arena buffers"
        );
        Some(first)
    }
}

/// Built-in extractor filling the geometry slot from the scene snapshot.
pub struct GeometryExtractor {
    scene: Arc<RwLock<Scene>>,
    mesh_bindings: Arc<HashMap<u64, MeshBinding>>,
    token: SlotToken<GeometryFrameData>,
}

impl GeometryExtractor {
    pub fn new(
        scene: Arc<RwLock<Scene>>,
        mesh_bindings: Arc<HashMap<u64, MeshBinding>>,
        token: SlotToken<GeometryFrameData>,
    ) -> Self {
        Self {
            scene,
            mesh_bindings,
            token,
        }
    }
}

impl Extractor for GeometryExtractor {
    fn name(&self) -> &str {
        "geometry"
    }

    fn extract(&mut self, frame: &mut FrameState) -> RenderResult<()> {
        let scene = self.scene.read();
        let data = frame.slot_mut(self.token);
        data.clear();
        data.camera = scene.camera.to_uniform();

        for (object_id, object) in scene.objects.iter().enumerate() {
            if !object.visible {
                continue;
            }
            let Some(&mesh) = self.mesh_bindings.get(&object.mesh_id) else {
                log::warn!(
                    "object {} refers to unknown mesh {}, skipped",
                    object_id,
                    object.mesh_id
                );
                continue;
            };
            data.batches.push(GeometryBatch {
                object_id: object_id as u64,
                mesh,
                material_id: object.material_id,
                model: object.transform.matrix(),
                bounds: object.bounds,
            });
        }

        Ok(())
    }
}

/// Frustum cull over batch bounding spheres; culled batches get their
/// instance count zeroed so the multi-draw skips them.
pub const CULL_SHADER: &str = r#"
struct DrawCommand {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
}

struct CullUniforms {
    view_proj: mat4x4<f32>,
    draw_count: u32,
}

@group(0) @binding(0) var<storage, read_write> commands: array<DrawCommand>;
@group(0) @binding(1) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> cull: CullUniforms;

@compute @workgroup_size(64)
fn cull_batches(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= cull.draw_count) {
        return;
    }

    let sphere = bounds[i];
    let center = cull.view_proj * vec4<f32>(sphere.xyz, 1.0);
    let radius = sphere.w;

    // Conservative clip-space sphere test against all six planes.
    let outside = center.x + radius < -center.w
        || center.x - radius > center.w
        || center.y + radius < -center.w
        || center.y - radius > center.w
        || center.z + radius < 0.0
        || center.z - radius > center.w;

    if (outside) {
        commands[i].instance_count = 0u;
    }
}
"#;
