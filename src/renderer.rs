use anyhow::{Context, Result};
use glam::{Mat4, Vec3, Vec4};
use winit::dpi::PhysicalSize;

use crate::camera3d::Camera3D;
use crate::config::ShadowConfig;
use crate::mesh::Mesh;

pub mod depth_bounds;
pub mod mesh_pass;
pub mod shadow_math;
pub mod shadow_pass;

use depth_bounds::{DepthBoundsParams, DepthBoundsPipeline};
use mesh_pass::{MeshPass, MeshPassParams};
use shadow_pass::{ShadowPass, ShadowPassParams};

pub const MAX_SHADOW_CASCADES: usize = 4;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Stride of per-draw uniform slots inside dynamic-offset buffers.
/// Matches wgpu's default `min_uniform_buffer_offset_alignment`.
pub(crate) const DRAW_UNIFORM_STRIDE: u64 = 256;

/// Single directional light plus its shadow settings.
#[derive(Debug, Clone)]
pub struct SceneLightingState {
    pub direction: Vec3,
    pub color: Vec3,
    pub ambient: Vec3,
    pub shadow_strength: f32,
    pub shadow_bias: f32,
    pub shadow_cascade_count: u32,
    pub shadow_resolution: u32,
    pub shadow_depth_bounds: bool,
}

impl SceneLightingState {
    pub fn from_config(config: &ShadowConfig) -> Self {
        Self {
            shadow_strength: config.strength,
            shadow_bias: config.bias,
            shadow_cascade_count: config.cascade_count,
            shadow_resolution: config.resolution,
            shadow_depth_bounds: config.depth_bounds,
            ..Self::default()
        }
    }
}

impl Default for SceneLightingState {
    fn default() -> Self {
        let config = ShadowConfig::default();
        Self {
            direction: Vec3::new(0.4, 0.35, -0.8).normalize(),
            color: Vec3::ONE,
            ambient: Vec3::splat(0.08),
            shadow_strength: config.strength,
            shadow_bias: config.bias,
            shadow_cascade_count: config.cascade_count,
            shadow_resolution: config.resolution,
            shadow_depth_bounds: config.depth_bounds,
        }
    }
}

/// One draw call: mesh, transform, material tint.
pub struct MeshDraw<'a> {
    pub mesh: &'a Mesh,
    pub model: Mat4,
    pub base_color: Vec4,
    pub casts_shadows: bool,
}

pub struct FrameParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub target: &'a wgpu::TextureView,
    pub target_format: wgpu::TextureFormat,
    pub viewport: PhysicalSize<u32>,
    pub camera: &'a Camera3D,
    pub lighting: &'a SceneLightingState,
    pub draws: &'a [MeshDraw<'a>],
}

/// Owns the per-frame passes and threads the shared state between them.
///
/// The host loop owns the device, queue and camera; this type borrows them
/// for the duration of one `render_frame` call.
pub struct SceneRenderer {
    shadow_pass: ShadowPass,
    depth_bounds: DepthBoundsPipeline,
    mesh_pass: MeshPass,
    depth_texture: Option<wgpu::Texture>,
    depth_view: Option<wgpu::TextureView>,
    depth_size: PhysicalSize<u32>,
}

impl SceneRenderer {
    pub fn new(config: &ShadowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shadow_pass: ShadowPass::new(),
            depth_bounds: DepthBoundsPipeline::new(),
            mesh_pass: MeshPass::new(),
            depth_texture: None,
            depth_view: None,
            depth_size: PhysicalSize::new(0, 0),
        })
    }

    pub fn render_frame(&mut self, params: FrameParams<'_>) -> Result<()> {
        let snapshot = params.camera.snapshot(params.viewport);
        self.ensure_depth_texture(params.device, params.viewport);

        if params.lighting.shadow_depth_bounds {
            self.depth_bounds.prepare(DepthBoundsParams {
                encoder: params.encoder,
                draws: params.draws,
                camera: &snapshot,
                device: params.device,
                queue: params.queue,
                viewport: params.viewport,
            })?;
        }
        let min_depth_bound = if params.lighting.shadow_depth_bounds {
            self.depth_bounds.min_depth_bound()
        } else {
            None
        };

        if self.shadow_pass.sample_layout().is_none() {
            self.shadow_pass.set_sample_layout(self.mesh_pass.shadow_sample_layout(params.device));
        }
        self.shadow_pass.prepare(ShadowPassParams {
            encoder: params.encoder,
            draws: params.draws,
            camera: &snapshot,
            lighting: params.lighting,
            device: params.device,
            queue: params.queue,
            min_depth_bound,
        })?;

        let depth_view = self.depth_view.as_ref().context("Scene depth texture missing")?;
        self.mesh_pass.render(MeshPassParams {
            encoder: params.encoder,
            target: params.target,
            target_format: params.target_format,
            depth: depth_view,
            draws: params.draws,
            camera: &snapshot,
            lighting: params.lighting,
            device: params.device,
            queue: params.queue,
            shadow_bind_group: self.shadow_pass.sample_bind_group(),
        })?;

        Ok(())
    }

    /// Registers the depth-bounds readback for this frame's submission.
    /// Call once after `queue.submit`.
    pub fn after_submit(&mut self) {
        self.depth_bounds.after_submit();
    }

    pub fn min_depth_bound(&self) -> Option<f32> {
        self.depth_bounds.min_depth_bound()
    }

    fn ensure_depth_texture(&mut self, device: &wgpu::Device, size: PhysicalSize<u32>) {
        if self.depth_texture.is_some() && self.depth_size == size {
            return;
        }
        let extent = wgpu::Extent3d {
            width: size.width.max(1),
            height: size.height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Scene Depth Texture"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.depth_texture = Some(texture);
        self.depth_view = Some(view);
        self.depth_size = size;
    }
}
