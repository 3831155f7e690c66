//! Scene snapshot types consumed by extraction.
//!
//! The renderer never reads simulation state directly; extraction copies the
//! relevant data out of the ECS (or any other source) into a [`Scene`]
//! snapshot, and from there into the write-role frame. Component types carry
//! `bevy_ecs` derives so they can live directly in an ECS world.

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3, Vec4};

use crate::backend::types::CameraUniform;

/// Transform component for positioning objects in 3D space
#[derive(Component, Debug, Clone, Copy)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

/// World-space bounding sphere used for cull eligibility.
#[derive(Debug, Clone, Copy)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

/// Mesh renderer component: which mesh/material an entity draws with.
#[derive(Component, Debug, Clone, Copy)]
pub struct MeshRenderer {
    pub mesh_id: u64,
    pub material_id: u64,
    /// Local-space bounds; objects without bounds cannot be GPU-culled.
    pub bounds: Option<BoundingSphere>,
    pub visible: bool,
}

impl MeshRenderer {
    pub fn new(mesh_id: u64, material_id: u64) -> Self {
        Self {
            mesh_id,
            material_id,
            bounds: None,
            visible: true,
        }
    }

    pub fn with_bounds(mut self, bounds: BoundingSphere) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

/// Camera projection type
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        half_width: f32,
        half_height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                half_width,
                half_height,
                near,
                far,
            } => Mat4::orthographic_rh(
                -half_width,
                half_width,
                -half_height,
                half_height,
                near,
                far,
            ),
        }
    }

    pub fn near_far(&self) -> (f32, f32) {
        match *self {
            Projection::Perspective { near, far, .. } => (near, far),
            Projection::Orthographic { near, far, .. } => (near, far),
        }
    }
}

/// Scene camera
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Build the GPU-facing uniform block for this camera.
    pub fn to_uniform(&self) -> CameraUniform {
        let view = self.view_matrix();
        let proj = self.projection.matrix();
        let (near, far) = self.projection.near_far();
        CameraUniform {
            view,
            proj,
            view_proj: proj * view,
            inv_view: view.inverse(),
            inv_proj: proj.inverse(),
            position: self.position.extend(1.0),
            near_far: Vec4::new(near, far, 0.0, 0.0),
        }
    }
}

/// A point light in the scene
#[derive(Debug, Clone, Copy)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

/// A renderable object snapshot
#[derive(Debug, Clone, Copy)]
pub struct RenderObject {
    pub mesh_id: u64,
    pub material_id: u64,
    pub transform: Transform,
    pub bounds: Option<BoundingSphere>,
    pub visible: bool,
}

/// The scene snapshot containing all renderable content.
///
/// Populated each tick (typically from the ECS via
/// [`sync_from_world`](Self::sync_from_world)) and read by extraction.
pub struct Scene {
    pub camera: Camera,
    pub lights: Vec<PointLight>,
    pub objects: Vec<RenderObject>,
    pub ambient_light: Vec3,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            camera: Camera::default(),
            lights: Vec::new(),
            objects: Vec::new(),
            ambient_light: Vec3::new(0.03, 0.03, 0.03),
        }
    }

    /// Add a point light to the scene
    pub fn add_point_light(&mut self, position: Vec3, color: Vec3, intensity: f32, radius: f32) {
        self.lights.push(PointLight {
            position,
            color,
            intensity,
            radius,
        });
    }

    /// Rebuild the object list from an ECS world.
    ///
    /// Queries every entity carrying both a [`Transform`] and a
    /// [`MeshRenderer`]; invisible renderers are kept out of the snapshot.
    pub fn sync_from_world(&mut self, world: &mut World) {
        self.objects.clear();
        let mut query = world.query::<(&Transform, &MeshRenderer)>();
        for (transform, renderer) in query.iter(world) {
            if !renderer.visible {
                continue;
            }
            let bounds = renderer.bounds.map(|b| BoundingSphere {
                center: transform.position + b.center * transform.scale,
                radius: b.radius * transform.scale.max_element(),
            });
            self.objects.push(RenderObject {
                mesh_id: renderer.mesh_id,
                material_id: renderer.material_id,
                transform: *transform,
                bounds,
                visible: true,
            });
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
