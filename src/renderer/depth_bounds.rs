//! Adaptive depth-bounds pipeline.
//!
//! Estimates the minimum on-screen depth of opaque geometry without stalling
//! the frame: each frame renders a z-prepass, reduces it to a single scalar
//! with an atomic-min compute pass, copies the result into a mappable buffer
//! and reads that buffer back a couple of frames later. The resulting bound
//! is advisory; the cascade builder uses it to tighten its near plane, and a
//! stale or missing value only costs shadow tightness, never correctness.

use anyhow::{Context, Result};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use winit::dpi::PhysicalSize;

use super::{MeshDraw, DEPTH_FORMAT, DRAW_UNIFORM_STRIDE};
use crate::camera3d::CameraSnapshot;

/// Number of pipelined slots. A readback is harvested as soon as its map
/// resolves (typically the next frame); a slot's buffers are reused
/// `DEPTH_BOUNDS_SLOTS` frames after the copy at the earliest.
pub const DEPTH_BOUNDS_SLOTS: usize = 3;

// Keep in sync with the workgroup size declared in depth_min_reduce.wgsl.
const REDUCE_WORKGROUP_SIZE: u32 = 8;

const PREPASS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// Cleared into the write buffer and the prepass target before reduction.
/// Positive IEEE-754 floats order the same as their bit patterns, so an
/// `atomicMin` over bit patterns is a float min that can only decrease this.
const DEPTH_SENTINEL: f32 = f32::MAX;

/// CPU bookkeeping for the slot rotation, kept separate from the GPU
/// resources so the staleness contract is testable without a device.
#[derive(Debug)]
pub struct ReadbackRing {
    slots: usize,
    current: usize,
    latest: f32,
}

impl ReadbackRing {
    pub fn new(slots: usize) -> Self {
        Self { slots: slots.max(1), current: 0, latest: DEPTH_SENTINEL }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots;
    }

    /// Folds a harvested readback into the best-known bound. Sentinel values
    /// (nothing rendered) and non-finite garbage keep the previous bound.
    pub fn harvest(&mut self, value: f32) {
        if value.is_finite() && value < DEPTH_SENTINEL {
            self.latest = value;
        }
    }

    pub fn bound(&self) -> Option<f32> {
        (self.latest < DEPTH_SENTINEL).then_some(self.latest)
    }
}

struct DepthBoundsSlot {
    target_view: wgpu::TextureView,
    write_buffer: wgpu::Buffer,
    read_buffer: wgpu::Buffer,
    reduce_bind_group: wgpu::BindGroup,
    pending: Option<Receiver<Result<(), wgpu::BufferAsyncError>>>,
}

struct DepthBoundsResources {
    prepass_pipeline: wgpu::RenderPipeline,
    reduce_pipeline: wgpu::ComputePipeline,
    reduce_bgl: wgpu::BindGroupLayout,
    draw_bgl: wgpu::BindGroupLayout,
    frame_buffer: wgpu::Buffer,
    frame_bind_group: wgpu::BindGroup,
}

/// Ring-buffered minimum-depth estimator. See the module docs for the
/// per-frame sequence.
#[derive(Default)]
pub struct DepthBoundsPipeline {
    resources: Option<DepthBoundsResources>,
    slots: Vec<DepthBoundsSlot>,
    depth_view: Option<wgpu::TextureView>,
    size: PhysicalSize<u32>,
    ring: Option<ReadbackRing>,
    draw_buffer: Option<wgpu::Buffer>,
    draw_bind_group: Option<wgpu::BindGroup>,
    draw_capacity: usize,
    copy_issued: bool,
}

pub struct DepthBoundsParams<'a> {
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub draws: &'a [MeshDraw<'a>],
    pub camera: &'a CameraSnapshot,
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub viewport: PhysicalSize<u32>,
}

impl DepthBoundsPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best-known minimum scene depth, one or more frames stale depending
    /// on when the map resolved. `None` until the first readback lands.
    pub fn min_depth_bound(&self) -> Option<f32> {
        self.ring.as_ref().and_then(ReadbackRing::bound)
    }

    pub fn prepare(&mut self, params: DepthBoundsParams<'_>) -> Result<()> {
        self.ensure_resources(params.device)?;
        self.ensure_targets(params.device, params.viewport)?;

        // Drive any outstanding map callbacks forward without blocking.
        let _ = params.device.poll(wgpu::PollType::Poll);

        let ring = self.ring.as_mut().context("Depth bounds ring missing")?;
        let current = ring.current();
        // Harvest every readback whose map has resolved, oldest slot first
        // so the newest value is the one that sticks.
        let slot_count = self.slots.len();
        let mut slot_busy = false;
        for offset in 0..slot_count {
            let index = (current + offset) % slot_count;
            let slot = self.slots.get_mut(index).context("Depth bounds slot missing")?;
            let Some(rx) = slot.pending.take() else {
                continue;
            };
            match rx.try_recv() {
                Ok(Ok(())) => {
                    let value = {
                        let data = slot.read_buffer.slice(..).get_mapped_range();
                        let bits: u32 = *bytemuck::from_bytes(&data[..4]);
                        f32::from_bits(bits)
                    };
                    slot.read_buffer.unmap();
                    ring.harvest(value);
                }
                Ok(Err(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    // Map still in flight; the slot's read buffer cannot be
                    // reused yet. The current slot skips its copy this frame
                    // and the stale bound keeps serving.
                    slot.pending = Some(rx);
                    if index == current {
                        slot_busy = true;
                    }
                }
            }
        }

        self.ensure_draw_capacity(params.device, params.draws.len());

        let resources = self.resources.as_ref().context("Depth bounds resources missing")?;
        let slot = &self.slots[current];
        let depth_view = self.depth_view.as_ref().context("Depth bounds depth texture missing")?;

        params.queue.write_buffer(
            &slot.write_buffer,
            0,
            bytemuck::bytes_of(&DEPTH_SENTINEL.to_bits()),
        );

        let view_proj = params.camera.slice_projection(params.camera.near, params.camera.far)
            * params.camera.view;
        let frame_data = PrepassFrameData {
            view_proj: view_proj.to_cols_array_2d(),
            view: params.camera.view.to_cols_array_2d(),
        };
        params.queue.write_buffer(&resources.frame_buffer, 0, bytemuck::bytes_of(&frame_data));

        let draw_buffer = self.draw_buffer.as_ref().context("Prepass draw buffer missing")?;
        let draw_bg = self.draw_bind_group.as_ref().context("Prepass draw bind group missing")?;
        for (index, draw) in params.draws.iter().enumerate() {
            let uniform = PrepassDrawUniform { model: draw.model.to_cols_array_2d() };
            params.queue.write_buffer(
                draw_buffer,
                index as u64 * DRAW_UNIFORM_STRIDE,
                bytemuck::bytes_of(&uniform),
            );
        }

        {
            let mut pass = params.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Z Prepass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &slot.target_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: DEPTH_SENTINEL as f64,
                            g: 0.0,
                            b: 0.0,
                            a: 0.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&resources.prepass_pipeline);
            pass.set_bind_group(0, &resources.frame_bind_group, &[]);
            for (index, draw) in params.draws.iter().enumerate() {
                let offset = (index as u64 * DRAW_UNIFORM_STRIDE) as u32;
                pass.set_bind_group(1, draw_bg, &[offset]);
                pass.set_vertex_buffer(0, draw.mesh.vertex_buffer.slice(..));
                pass.set_index_buffer(draw.mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..draw.mesh.index_count, 0, 0..1);
            }
        }

        {
            let mut pass = params.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Depth Min Reduce"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&resources.reduce_pipeline);
            pass.set_bind_group(0, &slot.reduce_bind_group, &[]);
            let groups_x = self.size.width.div_ceil(REDUCE_WORKGROUP_SIZE);
            let groups_y = self.size.height.div_ceil(REDUCE_WORKGROUP_SIZE);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        // Pass boundaries order the reduction's buffer writes before this
        // copy inside the same submission; no fence is needed because the
        // result is only read back frames later.
        if !slot_busy {
            params.encoder.copy_buffer_to_buffer(&slot.write_buffer, 0, &slot.read_buffer, 0, 4);
            self.copy_issued = true;
        }

        Ok(())
    }

    /// Registers the readback of this frame's copy and rotates the ring.
    /// Must run after the encoder built in `prepare` has been submitted.
    pub fn after_submit(&mut self) {
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        if self.copy_issued {
            let slot = &mut self.slots[ring.current()];
            let (tx, rx) = channel();
            slot.read_buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
            slot.pending = Some(rx);
            self.copy_issued = false;
        }
        ring.advance();
    }

    fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.resources.is_some() {
            return Ok(());
        }

        let prepass_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Depth Prepass Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../../assets/shaders/depth_prepass.wgsl").into(),
            ),
        });
        let reduce_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Depth Min Reduce Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../../assets/shaders/depth_min_reduce.wgsl").into(),
            ),
        });

        let frame_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Prepass Frame BGL"),
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
        });

        let draw_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Prepass Draw BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(
                        std::mem::size_of::<PrepassDrawUniform>() as u64,
                    ),
                },
                count: None,
            }],
        });

        let reduce_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Depth Reduce BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(4),
                    },
                    count: None,
                },
            ],
        });

        let prepass_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Prepass Pipeline Layout"),
            bind_group_layouts: &[&frame_bgl, &draw_bgl],
            push_constant_ranges: &[],
        });
        let prepass_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Prepass Pipeline"),
            layout: Some(&prepass_layout),
            vertex: wgpu::VertexState {
                module: &prepass_shader,
                entry_point: Some("vs_main"),
                buffers: &[crate::mesh::MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &prepass_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: PREPASS_FORMAT,
                    blend: None,
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

        let reduce_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Depth Reduce Pipeline Layout"),
            bind_group_layouts: &[&reduce_bgl],
            push_constant_ranges: &[],
        });
        let reduce_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Depth Reduce Pipeline"),
            layout: Some(&reduce_layout),
            module: &reduce_shader,
            entry_point: Some("cs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Prepass Frame Buffer"),
            size: std::mem::size_of::<PrepassFrameData>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Prepass Frame BG"),
            layout: &frame_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });

        self.resources = Some(DepthBoundsResources {
            prepass_pipeline,
            reduce_pipeline,
            reduce_bgl,
            draw_bgl,
            frame_buffer,
            frame_bind_group,
        });
        self.ring = Some(ReadbackRing::new(DEPTH_BOUNDS_SLOTS));
        Ok(())
    }

    fn ensure_targets(&mut self, device: &wgpu::Device, viewport: PhysicalSize<u32>) -> Result<()> {
        let size = PhysicalSize::new(viewport.width.max(1), viewport.height.max(1));
        if !self.slots.is_empty() && self.size == size {
            return Ok(());
        }
        let resources = self.resources.as_ref().context("Depth bounds resources missing")?;

        let extent = wgpu::Extent3d { width: size.width, height: size.height, depth_or_array_layers: 1 };
        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Prepass Depth Texture"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        self.depth_view = Some(depth_texture.create_view(&wgpu::TextureViewDescriptor::default()));

        let mut slots = Vec::with_capacity(DEPTH_BOUNDS_SLOTS);
        for _ in 0..DEPTH_BOUNDS_SLOTS {
            let target = device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Prepass Target"),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: PREPASS_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());
            let write_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Depth Bounds Write Buffer"),
                size: 4,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let read_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Depth Bounds Read Buffer"),
                size: 4,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            let reduce_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Depth Reduce BG"),
                layout: &resources.reduce_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&target_view),
                    },
                    wgpu::BindGroupEntry { binding: 1, resource: write_buffer.as_entire_binding() },
                ],
            });
            slots.push(DepthBoundsSlot {
                target_view,
                write_buffer,
                read_buffer,
                reduce_bind_group,
                pending: None,
            });
        }
        self.slots = slots;
        self.size = size;
        self.copy_issued = false;
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
            label: Some("Prepass Draw Buffer"),
            size: new_cap as u64 * DRAW_UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Prepass Draw BG"),
            layout: &resources.draw_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<PrepassDrawUniform>() as u64),
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
struct PrepassFrameData {
    view_proj: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PrepassDrawUniform {
    model: [[f32; 4]; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_rotates_modulo_slot_count() {
        let mut ring = ReadbackRing::new(3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(ring.current());
            ring.advance();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn ring_ignores_sentinel_and_garbage() {
        let mut ring = ReadbackRing::new(3);
        assert_eq!(ring.bound(), None);
        ring.harvest(f32::MAX);
        assert_eq!(ring.bound(), None);
        ring.harvest(f32::NAN);
        assert_eq!(ring.bound(), None);
        ring.harvest(4.5);
        assert_eq!(ring.bound(), Some(4.5));
        ring.harvest(f32::INFINITY);
        assert_eq!(ring.bound(), Some(4.5));
    }

    #[test]
    fn same_frame_harvests_fold_oldest_first() {
        // Two maps resolving in the same frame are harvested in slot age
        // order, so the later copy's value wins.
        let mut ring = ReadbackRing::new(3);
        ring.harvest(10.0);
        ring.harvest(6.5);
        assert_eq!(ring.bound(), Some(6.5));
    }

    #[test]
    fn ring_keeps_stale_bound_until_fresh_value() {
        let mut ring = ReadbackRing::new(3);
        ring.harvest(2.0);
        for _ in 0..5 {
            ring.advance();
        }
        assert_eq!(ring.bound(), Some(2.0));
        ring.harvest(1.25);
        assert_eq!(ring.bound(), Some(1.25));
    }
}
