use anyhow::{Context, Result};
use std::sync::Arc;

use super::{MeshDraw, SceneLightingState, DEPTH_FORMAT, DRAW_UNIFORM_STRIDE};
use crate::camera3d::CameraSnapshot;

struct MeshPipelineResources {
    pipeline: wgpu::RenderPipeline,
    draw_bgl: Arc<wgpu::BindGroupLayout>,
    format: wgpu::TextureFormat,
}

/// Forward lit pass for the single directional light. Shadowing data (the
/// cascade transform array, per-cascade sample sizes and depth boundaries,
/// the map array and its comparison sampler) comes in through the bind
/// group owned by `ShadowPass`.
#[derive(Default)]
pub struct MeshPass {
    resources: Option<MeshPipelineResources>,
    shadow_bgl: Option<Arc<wgpu::BindGroupLayout>>,
    frame_buffer: Option<wgpu::Buffer>,
    frame_bind_group: Option<wgpu::BindGroup>,
    draw_buffer: Option<wgpu::Buffer>,
    draw_bind_group: Option<wgpu::BindGroup>,
    draw_capacity: usize,
}

pub struct MeshPassParams<'a> {
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub target: &'a wgpu::TextureView,
    pub target_format: wgpu::TextureFormat,
    pub depth: &'a wgpu::TextureView,
    pub draws: &'a [MeshDraw<'a>],
    pub camera: &'a CameraSnapshot,
    pub lighting: &'a SceneLightingState,
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub shadow_bind_group: Option<&'a wgpu::BindGroup>,
}

impl MeshPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout of the shadow sample bind group; handed to `ShadowPass` so it
    /// can build the matching bind group around its map and sampler.
    pub fn shadow_sample_layout(&mut self, device: &wgpu::Device) -> Arc<wgpu::BindGroupLayout> {
        if let Some(layout) = self.shadow_bgl.as_ref() {
            return layout.clone();
        }
        let layout = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Sample BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        sample_type: wgpu::TextureSampleType::Depth,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        }));
        self.shadow_bgl = Some(layout.clone());
        layout
    }

    pub fn render(&mut self, params: MeshPassParams<'_>) -> Result<()> {
        self.ensure_resources(params.device, params.target_format)?;
        self.ensure_draw_capacity(params.device, params.draws.len());

        let shadow_bg = params.shadow_bind_group.context("Shadow sample bind group missing")?;
        let resources = self.resources.as_ref().context("Mesh pipeline resources missing")?;
        let frame_buffer = self.frame_buffer.as_ref().context("Mesh frame buffer missing")?;
        let frame_bg = self.frame_bind_group.as_ref().context("Mesh frame bind group missing")?;
        let draw_buffer = self.draw_buffer.as_ref().context("Mesh draw buffer missing")?;
        let draw_bg = self.draw_bind_group.as_ref().context("Mesh draw bind group missing")?;

        let view_proj =
            params.camera.slice_projection(params.camera.near, params.camera.far) * params.camera.view;
        let camera_pos = params.camera.view.inverse().w_axis;
        let frame_data = MeshFrameData {
            view_proj: view_proj.to_cols_array_2d(),
            view: params.camera.view.to_cols_array_2d(),
            camera_pos: camera_pos.to_array(),
            light_dir: params.lighting.direction.normalize().extend(0.0).to_array(),
            light_color: params.lighting.color.extend(1.0).to_array(),
            ambient_color: params.lighting.ambient.extend(1.0).to_array(),
            depth_params: [params.camera.near, params.camera.far, 0.0, 0.0],
        };
        params.queue.write_buffer(frame_buffer, 0, bytemuck::bytes_of(&frame_data));

        for (index, draw) in params.draws.iter().enumerate() {
            let draw_data = MeshDrawData {
                model: draw.model.to_cols_array_2d(),
                base_color: draw.base_color.to_array(),
            };
            params.queue.write_buffer(
                draw_buffer,
                index as u64 * DRAW_UNIFORM_STRIDE,
                bytemuck::bytes_of(&draw_data),
            );
        }

        let mut pass = params.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Mesh Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: params.target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r: 0.05, g: 0.06, b: 0.1, a: 1.0 }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: params.depth,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&resources.pipeline);
        pass.set_bind_group(0, frame_bg, &[]);
        pass.set_bind_group(2, shadow_bg, &[]);
        for (index, draw) in params.draws.iter().enumerate() {
            let offset = (index as u64 * DRAW_UNIFORM_STRIDE) as u32;
            pass.set_bind_group(1, draw_bg, &[offset]);
            pass.set_vertex_buffer(0, draw.mesh.vertex_buffer.slice(..));
            pass.set_index_buffer(draw.mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..draw.mesh.index_count, 0, 0..1);
        }

        Ok(())
    }

    fn ensure_resources(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) -> Result<()> {
        if let Some(resources) = self.resources.as_ref() {
            if resources.format == format {
                return Ok(());
            }
            self.resources = None;
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/mesh_lit.wgsl").into()),
        });

        let frame_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mesh Frame BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let draw_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mesh Draw BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<MeshDrawData>() as u64),
                },
                count: None,
            }],
        }));

        let shadow_bgl = self.shadow_sample_layout(device);

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Mesh Pipeline Layout"),
            bind_group_layouts: &[&frame_bgl, draw_bgl.as_ref(), shadow_bgl.as_ref()],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Mesh Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[crate::mesh::MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
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

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mesh Frame Buffer"),
            size: std::mem::size_of::<MeshFrameData>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Frame BG"),
            layout: &frame_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });

        self.resources = Some(MeshPipelineResources { pipeline, draw_bgl, format });
        self.frame_buffer = Some(frame_buffer);
        self.frame_bind_group = Some(frame_bind_group);
        // Draw buffer binds against the new layout next ensure call.
        self.draw_buffer = None;
        self.draw_bind_group = None;
        self.draw_capacity = 0;
        Ok(())
    }

    fn ensure_draw_capacity(&mut self, device: &wgpu::Device, count: usize) {
        if self.draw_capacity >= count && self.draw_buffer.is_some() {
            return;
        }
        let Some(resources) = self.resources.as_ref() else {
            return;
        };
        let mut new_cap = self.draw_capacity.max(64);
        while new_cap < count {
            new_cap *= 2;
        }
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mesh Draw Buffer"),
            size: new_cap as u64 * DRAW_UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Draw BG"),
            layout: resources.draw_bgl.as_ref(),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<MeshDrawData>() as u64),
                }),
            }],
        });
        self.draw_buffer = Some(buffer);
        self.draw_bind_group = Some(bind_group);
        self.draw_capacity = new_cap;
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MeshFrameData {
    view_proj: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    camera_pos: [f32; 4],
    light_dir: [f32; 4],
    light_color: [f32; 4],
    ambient_color: [f32; 4],
    depth_params: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MeshDrawData {
    model: [[f32; 4]; 4],
    base_color: [f32; 4],
}
