use anyhow::{Context, Result};
use std::sync::Arc;

use super::shadow_math::{build_cascades, CascadeSet};
use super::{MeshDraw, SceneLightingState, DEPTH_FORMAT, DRAW_UNIFORM_STRIDE, MAX_SHADOW_CASCADES};
use crate::camera3d::CameraSnapshot;

struct ShadowPipelineResources {
    pipeline: wgpu::RenderPipeline,
    draw_bgl: Arc<wgpu::BindGroupLayout>,
}

/// Renders the cascade shadow map: one depth layer per cascade, each fitted
/// to its slice of the camera frustum by `shadow_math::build_cascades`.
#[derive(Default)]
pub struct ShadowPass {
    resources: Option<ShadowPipelineResources>,
    uniform_buffer: Option<wgpu::Buffer>,
    frame_bind_group: Option<wgpu::BindGroup>,
    cascade_index_buffer: Option<wgpu::Buffer>,
    cascade_index_bind_group: Option<wgpu::BindGroup>,
    draw_buffer: Option<wgpu::Buffer>,
    draw_bind_group: Option<wgpu::BindGroup>,
    draw_capacity: usize,
    map_texture: Option<wgpu::Texture>,
    map_view: Option<wgpu::TextureView>,
    cascade_views: Vec<wgpu::TextureView>,
    sampler: Option<wgpu::Sampler>,
    sample_layout: Option<Arc<wgpu::BindGroupLayout>>,
    sample_bind_group: Option<wgpu::BindGroup>,
    resolution: u32,
    cascade_set: CascadeSet,
    cascade_count: usize,
}

pub struct ShadowPassParams<'a> {
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub draws: &'a [MeshDraw<'a>],
    pub camera: &'a CameraSnapshot,
    pub lighting: &'a SceneLightingState,
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub min_depth_bound: Option<f32>,
}

impl ShadowPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sample_layout(&mut self, layout: Arc<wgpu::BindGroupLayout>) {
        self.sample_layout = Some(layout);
        self.sample_bind_group = None;
    }

    pub fn sample_layout(&self) -> Option<&Arc<wgpu::BindGroupLayout>> {
        self.sample_layout.as_ref()
    }

    pub fn sample_bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.sample_bind_group.as_ref()
    }

    pub fn cascade_set(&self) -> &CascadeSet {
        &self.cascade_set
    }

    pub fn prepare(&mut self, params: ShadowPassParams<'_>) -> Result<()> {
        self.ensure_resources(params.device)?;
        self.sync_config(params.lighting, params.device)?;

        let shadow_strength = params.lighting.shadow_strength.clamp(0.0, 1.0);
        let casters: Vec<&MeshDraw> = params.draws.iter().filter(|draw| draw.casts_shadows).collect();
        if casters.is_empty() || shadow_strength <= 0.0 {
            self.cascade_set = CascadeSet::default();
            self.write_shadow_uniform(params.queue, params.lighting, 0.0)?;
            return Ok(());
        }

        self.cascade_set = build_cascades(
            params.camera,
            params.lighting.direction,
            self.cascade_count,
            self.resolution,
            params.min_depth_bound,
        )?;

        let (pipeline, draw_bgl) = {
            let resources = self.resources.as_ref().context("Shadow pipeline resources missing")?;
            (resources.pipeline.clone(), resources.draw_bgl.clone())
        };
        let frame_bg = self.frame_bind_group.as_ref().context("Shadow frame bind group missing")?.clone();
        let cascade_bg =
            self.cascade_index_bind_group.as_ref().context("Shadow cascade bind group missing")?.clone();

        self.ensure_draw_capacity(params.device, &draw_bgl, casters.len());
        let draw_buffer = self.draw_buffer.as_ref().context("Shadow draw buffer missing")?.clone();
        let draw_bg = self.draw_bind_group.as_ref().context("Shadow draw bind group missing")?.clone();
        for (slot, draw) in casters.iter().enumerate() {
            let draw_uniform = ShadowDrawUniform { model: draw.model.to_cols_array_2d() };
            params.queue.write_buffer(
                &draw_buffer,
                slot as u64 * DRAW_UNIFORM_STRIDE,
                bytemuck::bytes_of(&draw_uniform),
            );
        }

        self.write_shadow_uniform(params.queue, params.lighting, shadow_strength)?;
        let cascade_index_buffer =
            self.cascade_index_buffer.as_ref().context("Shadow cascade index buffer missing")?;
        for idx in 0..self.cascade_count {
            let uniform = CascadeIndexUniform { index: idx as u32, _padding: [0; 3] };
            params.queue.write_buffer(
                cascade_index_buffer,
                idx as u64 * DRAW_UNIFORM_STRIDE,
                bytemuck::bytes_of(&uniform),
            );
        }

        let resolution = self.resolution.max(1);
        for cascade_index in 0..self.cascade_count {
            let layer_view =
                self.cascade_views.get(cascade_index).cloned().context("Shadow cascade view missing")?;
            let mut pass = params.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Shadow Pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &layer_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            let res_f = resolution as f32;
            pass.set_viewport(0.0, 0.0, res_f, res_f, 0.0, 1.0);
            pass.set_scissor_rect(0, 0, resolution, resolution);
            pass.set_bind_group(0, &frame_bg, &[]);
            let cascade_offset = (cascade_index as u64 * DRAW_UNIFORM_STRIDE) as u32;
            pass.set_bind_group(1, &cascade_bg, &[cascade_offset]);

            for (slot, draw) in casters.iter().enumerate() {
                let offset = (slot as u64 * DRAW_UNIFORM_STRIDE) as u32;
                pass.set_bind_group(2, &draw_bg, &[offset]);
                pass.set_vertex_buffer(0, draw.mesh.vertex_buffer.slice(..));
                pass.set_index_buffer(draw.mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..draw.mesh.index_count, 0, 0..1);
            }
        }

        Ok(())
    }

    fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.resources.is_none() {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Shadow Shader"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../../assets/shaders/mesh_shadow.wgsl").into(),
                ),
            });

            let frame_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Frame BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            }));

            let cascade_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Cascade BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<CascadeIndexUniform>() as u64,
                        ),
                    },
                    count: None,
                }],
            });

            let draw_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Draw BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<ShadowDrawUniform>() as u64,
                        ),
                    },
                    count: None,
                }],
            }));

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Shadow Pipeline Layout"),
                bind_group_layouts: &[frame_bgl.as_ref(), &cascade_bgl, draw_bgl.as_ref()],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Shadow Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[crate::mesh::MeshVertex::layout()],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: None,
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

            let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shadow Uniform Buffer"),
                size: std::mem::size_of::<ShadowUniform>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Shadow Frame BG"),
                layout: frame_bgl.as_ref(),
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                }],
            });

            // One slot per cascade, selected with a dynamic offset so every
            // layer pass reads its own index from the same buffer.
            let cascade_index_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shadow Cascade Index Buffer"),
                size: MAX_SHADOW_CASCADES as u64 * DRAW_UNIFORM_STRIDE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let cascade_index_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Shadow Cascade BG"),
                layout: &cascade_bgl,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &cascade_index_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<CascadeIndexUniform>() as u64),
                    }),
                }],
            });

            self.resources = Some(ShadowPipelineResources { pipeline, draw_bgl });
            self.uniform_buffer = Some(uniform_buffer);
            self.frame_bind_group = Some(frame_bind_group);
            self.cascade_index_buffer = Some(cascade_index_buffer);
            self.cascade_index_bind_group = Some(cascade_index_bind_group);
        }

        if self.map_texture.is_none() || self.map_view.is_none() {
            self.recreate_shadow_map(device)?;
        }

        if self.sampler.is_none() {
            let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Shadow Sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                lod_min_clamp: 0.0,
                lod_max_clamp: 0.0,
                compare: Some(wgpu::CompareFunction::LessEqual),
                anisotropy_clamp: 1,
                border_color: None,
            });
            self.sampler = Some(sampler);
        }

        if self.sample_bind_group.is_none() {
            if let (Some(layout), Some(buffer), Some(view), Some(sampler)) = (
                self.sample_layout.as_ref(),
                self.uniform_buffer.as_ref(),
                self.map_view.as_ref(),
                self.sampler.as_ref(),
            ) {
                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Shadow Sample BG"),
                    layout: layout.as_ref(),
                    entries: &[
                        wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        },
                    ],
                });
                self.sample_bind_group = Some(bind_group);
            }
        }

        Ok(())
    }

    fn sync_config(&mut self, lighting: &SceneLightingState, device: &wgpu::Device) -> Result<()> {
        let desired_cascades = lighting.shadow_cascade_count.clamp(1, MAX_SHADOW_CASCADES as u32) as usize;
        let desired_resolution = lighting.shadow_resolution.clamp(256, 8192);
        let mut needs_recreate = false;
        if self.cascade_count != desired_cascades {
            self.cascade_count = desired_cascades;
            needs_recreate = true;
        }
        if self.resolution != desired_resolution {
            self.resolution = desired_resolution;
            needs_recreate = true;
        }
        if needs_recreate {
            self.recreate_shadow_map(device)?;
        }
        Ok(())
    }

    fn recreate_shadow_map(&mut self, device: &wgpu::Device) -> Result<()> {
        let resolution = self.resolution.max(1);
        let cascade_layers = self.cascade_count.max(1);
        let extent = wgpu::Extent3d {
            width: resolution,
            height: resolution,
            depth_or_array_layers: cascade_layers as u32,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Shadow Map"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Shadow Map Array View"),
            format: Some(DEPTH_FORMAT),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: 0,
            array_layer_count: None,
            ..Default::default()
        });
        let mut layer_views = Vec::with_capacity(cascade_layers);
        for layer in 0..cascade_layers {
            layer_views.push(texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some("Shadow Map Cascade Layer"),
                format: Some(DEPTH_FORMAT),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_mip_level: 0,
                mip_level_count: None,
                base_array_layer: layer as u32,
                array_layer_count: Some(1),
                ..Default::default()
            }));
        }
        self.map_texture = Some(texture);
        self.map_view = Some(view);
        self.cascade_views = layer_views;
        self.sample_bind_group = None;
        Ok(())
    }

    fn ensure_draw_capacity(
        &mut self,
        device: &wgpu::Device,
        draw_bgl: &wgpu::BindGroupLayout,
        count: usize,
    ) {
        if self.draw_capacity >= count && self.draw_buffer.is_some() {
            return;
        }
        let mut new_cap = self.draw_capacity.max(64);
        while new_cap < count {
            new_cap *= 2;
        }
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shadow Draw Buffer"),
            size: new_cap as u64 * DRAW_UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shadow Draw BG"),
            layout: draw_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<ShadowDrawUniform>() as u64),
                }),
            }],
        });
        self.draw_buffer = Some(buffer);
        self.draw_bind_group = Some(bind_group);
        self.draw_capacity = new_cap;
    }

    fn write_shadow_uniform(
        &mut self,
        queue: &wgpu::Queue,
        lighting: &SceneLightingState,
        strength: f32,
    ) -> Result<()> {
        let buffer = self.uniform_buffer.as_ref().context("Shadow uniform buffer missing")?;
        let bias = lighting.shadow_bias.clamp(0.00001, 0.05);
        let mut gpu_matrices = [[[0.0f32; 4]; 4]; MAX_SHADOW_CASCADES];
        for (dst, src) in gpu_matrices.iter_mut().zip(self.cascade_set.matrices.iter()) {
            *dst = src.to_cols_array_2d();
        }
        let inv_resolution = 1.0 / self.resolution.max(1) as f32;
        let mut cascade_params = [[0.0f32; 4]; MAX_SHADOW_CASCADES];
        for (idx, entry) in cascade_params.iter_mut().enumerate() {
            entry[0] = self.cascade_set.sample_sizes[idx];
            entry[1] = self.cascade_set.depth_boundaries[idx];
            entry[2] = inv_resolution;
        }
        let params = [
            bias,
            strength.clamp(0.0, 1.0),
            self.cascade_set.count as f32,
            self.cascade_set.effective_near,
        ];
        let data = ShadowUniform { light_view_proj: gpu_matrices, params, cascade_params };
        queue.write_buffer(buffer, 0, bytemuck::bytes_of(&data));
        Ok(())
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ShadowUniform {
    light_view_proj: [[[f32; 4]; 4]; MAX_SHADOW_CASCADES],
    params: [f32; 4],
    cascade_params: [[f32; 4]; MAX_SHADOW_CASCADES],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ShadowDrawUniform {
    model: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CascadeIndexUniform {
    index: u32,
    _padding: [u32; 3],
}
