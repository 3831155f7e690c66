//! Shared render targets of the deferred pipeline.
//!
//! All targets are allocated once at startup, sized to the configured
//! viewport, and keep their handles for the lifetime of the set — the
//! handles are the contract through which extensions bind each other's
//! outputs as inputs. Resizing requires rebuilding the whole set.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};

/// One color target with its stable handles.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub format: TextureFormat,
}

/// The geometry buffer: per-pixel geometric and material data written by the
/// geometry pass and consumed by the lighting passes.
#[derive(Debug, Clone, Copy)]
pub struct GeometryBuffer {
    /// World position (xyz) + roughness (w).
    pub position_roughness: RenderTarget,
    /// World normal (xyz) + ambient occlusion (w).
    pub normal_ambient: RenderTarget,
    /// Base color (rgb) + metallic (a).
    pub albedo_metallic: RenderTarget,
    /// Screen-space motion (xy) + linear depth (z) + transparency (w).
    pub motion_transparency: RenderTarget,
    /// Linear depth (r) + object index (g).
    pub depth_index: RenderTarget,
}

impl GeometryBuffer {
    fn channels(&self) -> [RenderTarget; 5] {
        [
            self.position_roughness,
            self.normal_ambient,
            self.albedo_metallic,
            self.motion_transparency,
            self.depth_index,
        ]
    }
}

/// Destination selector used by render systems sharing a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedTarget {
    /// The geometry MRT (all five channels + shared depth).
    Geometry,
    /// Screen-space reflection accumulation.
    Reflection,
    /// Forward-shaded output (uses the shared depth buffer).
    Forward,
    /// Light accumulation consumed by the combine stage.
    LightAccumulation,
    /// Half-resolution auxiliary buffer for cheap effects.
    HalfResolution,
    /// The composed output presented to the swapchain.
    FinalColor,
}

/// The deferred pipeline's fixed set of GPU render targets.
#[derive(Debug)]
pub struct RenderTargetSet {
    geometry: GeometryBuffer,
    reflection: RenderTarget,
    forward: RenderTarget,
    light_accumulation: RenderTarget,
    half_resolution: RenderTarget,
    final_color: RenderTarget,
    /// Depth buffer shared by every full-resolution pass.
    depth: RenderTarget,
    width: u32,
    height: u32,
}

impl RenderTargetSet {
    /// Allocate every target through the backend.
    ///
    /// Viewport dimensions are validated eagerly; a zero-sized viewport is a
    /// construction error, not a deferred GPU error.
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "render target viewport must be non-zero, got {width}x{height}"
            )));
        }

        let attach = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let mut target = |backend: &mut dyn GraphicsBackend,
                          label: &str,
                          w: u32,
                          h: u32,
                          format: TextureFormat|
         -> RenderResult<RenderTarget> {
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(label.to_string()),
                width: w,
                height: h,
                depth: 1,
                mip_levels: 1,
                format,
                usage: attach,
            })?;
            let view = backend.create_texture_view(texture)?;
            Ok(RenderTarget {
                texture,
                view,
                format,
            })
        };

        let geometry = GeometryBuffer {
            position_roughness: target(
                backend,
                "gbuffer_position_roughness",
                width,
                height,
                TextureFormat::Rgba32Float,
            )?,
            normal_ambient: target(
                backend,
                "gbuffer_normal_ambient",
                width,
                height,
                TextureFormat::Rgba16Float,
            )?,
            albedo_metallic: target(
                backend,
                "gbuffer_albedo_metallic",
                width,
                height,
                TextureFormat::Rgba8Unorm,
            )?,
            motion_transparency: target(
                backend,
                "gbuffer_motion_transparency",
                width,
                height,
                TextureFormat::Rgba16Float,
            )?,
            depth_index: target(
                backend,
                "gbuffer_depth_index",
                width,
                height,
                TextureFormat::Rg32Float,
            )?,
        };

        let half_w = (width / 2).max(1);
        let half_h = (height / 2).max(1);

        Ok(Self {
            geometry,
            reflection: target(backend, "reflection", width, height, TextureFormat::Rgba16Float)?,
            forward: target(backend, "forward", width, height, TextureFormat::Rgba16Float)?,
            light_accumulation: target(
                backend,
                "light_accumulation",
                width,
                height,
                TextureFormat::Rgba16Float,
            )?,
            half_resolution: target(
                backend,
                "half_resolution",
                half_w,
                half_h,
                TextureFormat::Rgba16Float,
            )?,
            final_color: target(backend, "final_color", width, height, TextureFormat::Rgba8Unorm)?,
            depth: target(backend, "shared_depth", width, height, TextureFormat::Depth32Float)?,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn geometry(&self) -> &GeometryBuffer {
        &self.geometry
    }

    pub fn reflection(&self) -> RenderTarget {
        self.reflection
    }

    pub fn forward(&self) -> RenderTarget {
        self.forward
    }

    pub fn light_accumulation(&self) -> RenderTarget {
        self.light_accumulation
    }

    pub fn half_resolution(&self) -> RenderTarget {
        self.half_resolution
    }

    pub fn final_color(&self) -> RenderTarget {
        self.final_color
    }

    pub fn depth(&self) -> RenderTarget {
        self.depth
    }

    /// Resolve a [`SharedTarget`] to its primary color view.
    pub fn view_of(&self, target: SharedTarget) -> TextureViewHandle {
        match target {
            SharedTarget::Geometry => self.geometry.albedo_metallic.view,
            SharedTarget::Reflection => self.reflection.view,
            SharedTarget::Forward => self.forward.view,
            SharedTarget::LightAccumulation => self.light_accumulation.view,
            SharedTarget::HalfResolution => self.half_resolution.view,
            SharedTarget::FinalColor => self.final_color.view,
        }
    }

    /// Bind a target as the active destination, optionally clearing it.
    ///
    /// The geometry target binds all five MRT channels plus the shared
    /// depth buffer; forward also attaches the shared depth so it composes
    /// with the geometry pass output. The caller ends the pass through the
    /// backend when done.
    pub fn bind(&self, backend: &mut dyn GraphicsBackend, target: SharedTarget, clear: bool) {
        let load_op = |clear: bool| {
            if clear {
                LoadOp::Clear([0.0, 0.0, 0.0, 0.0])
            } else {
                LoadOp::Load
            }
        };

        match target {
            SharedTarget::Geometry => {
                let color_attachments = self
                    .geometry
                    .channels()
                    .iter()
                    .map(|channel| ColorAttachment {
                        view: channel.view,
                        load_op: load_op(clear),
                        store_op: StoreOp::Store,
                    })
                    .collect();
                backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some("geometry".to_string()),
                    color_attachments,
                    depth_stencil_attachment: Some(DepthStencilAttachment {
                        view: self.depth.view,
                        depth_load_op: if clear {
                            LoadOp::Clear([1.0, 0.0, 0.0, 0.0])
                        } else {
                            LoadOp::Load
                        },
                        depth_store_op: StoreOp::Store,
                        depth_clear_value: 1.0,
                    }),
                });
            }
            SharedTarget::Forward => {
                backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some("forward".to_string()),
                    color_attachments: vec![ColorAttachment {
                        view: self.forward.view,
                        load_op: load_op(clear),
                        store_op: StoreOp::Store,
                    }],
                    depth_stencil_attachment: Some(DepthStencilAttachment {
                        view: self.depth.view,
                        depth_load_op: LoadOp::Load,
                        depth_store_op: StoreOp::Store,
                        depth_clear_value: 1.0,
                    }),
                });
            }
            other => {
                backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some(format!("{other:?}").to_lowercase()),
                    color_attachments: vec![ColorAttachment {
                        view: self.view_of(other),
                        load_op: load_op(clear),
                        store_op: StoreOp::Store,
                    }],
                    depth_stencil_attachment: None,
                });
            }
        }
    }
}
