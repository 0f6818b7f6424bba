//! wgpu backend: the layer shader on an offscreen target with readback.

use std::collections::BTreeMap;
use std::num::NonZeroU64;

use image::RgbaImage;
use wgpu::util::DeviceExt;

use lockstep_common::{LockstepError, LockstepResult};

use crate::backend::{DrawCall, RenderBackend};
use crate::texture::TextureSlot;
use crate::uniforms::LayerUniforms;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub(crate) const LAYER_SHADER: &str = r#"
struct LayerUniform {
    matrix: mat4x4<f32>,
    // TL.xy, TR.xy
    pin_top: vec4<f32>,
    // BL.xy, BR.xy
    pin_bottom: vec4<f32>,
    // luma weights, distort
    luma: vec4<f32>,
    // use_pin, use_matte, invert, gamma
    flags: vec4<f32>,
};

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) local: vec2<f32>,
};

@group(1) @binding(0)
var<uniform> layer: LayerUniform;

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = layer.matrix * vec4<f32>(position, 0.0, 1.0);
    out.local = position;
    return out;
}

@group(0) @binding(0)
var color_tex: texture_2d<f32>;
@group(0) @binding(1)
var matte_tex: texture_2d<f32>;
@group(0) @binding(2)
var layer_sampler: sampler;

fn lerp2(a: vec2<f32>, b: vec2<f32>, t: f32) -> vec2<f32> {
    return a + (b - a) * t;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let x = input.local.x * 0.5 + 0.5;
    let y = 0.5 - input.local.y * 0.5;
    var uv = vec2<f32>(x, y);
    if (layer.flags.x > 0.5) {
        let top = lerp2(layer.pin_top.xy, layer.pin_top.zw, x);
        let bottom = lerp2(layer.pin_bottom.xy, layer.pin_bottom.zw, x);
        uv = lerp2(top, bottom, y);
    }

    let src = textureSample(color_tex, layer_sampler, uv);
    let matte = textureSample(matte_tex, layer_sampler, uv);
    var alpha = src.a;
    if (layer.flags.y > 0.5) {
        var lum = clamp(dot(matte.rgb, layer.luma.xyz), 0.0, 1.0);
        if (layer.flags.w > 0.5) {
            lum = pow(lum, 1.0 / 2.2);
        }
        if (layer.flags.z > 0.5) {
            lum = 1.0 - lum;
        }
        alpha = clamp(lum, 0.0, 1.0) * src.a;
    }
    return vec4<f32>(src.rgb * alpha, alpha);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuLayerUniform {
    matrix: [f32; 16],
    pin_top: [f32; 4],
    pin_bottom: [f32; 4],
    luma: [f32; 4],
    flags: [f32; 4],
}

impl GpuLayerUniform {
    fn new(uniforms: &LayerUniforms, has_matte: bool) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let [tl, tr, bl, br] = uniforms
            .corner_pin
            .unwrap_or([[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let w = uniforms.luma_weights;
        Self {
            matrix: uniforms.matrix,
            pin_top: [tl[0], tl[1], tr[0], tr[1]],
            pin_bottom: [bl[0], bl[1], br[0], br[1]],
            luma: [w[0], w[1], w[2], uniforms.distort],
            flags: [
                flag(uniforms.corner_pin.is_some()),
                flag(has_matte),
                flag(uniforms.matte.invert),
                flag(uniforms.matte.gamma_correct),
            ],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
}

const QUAD_VERTICES: [Vertex; 6] = [
    Vertex { position: [-1.0, -1.0] },
    Vertex { position: [1.0, -1.0] },
    Vertex { position: [1.0, 1.0] },
    Vertex { position: [-1.0, -1.0] },
    Vertex { position: [1.0, 1.0] },
    Vertex { position: [-1.0, 1.0] },
];

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    texture_layout: wgpu::BindGroupLayout,
    uniform_bind_group: wgpu::BindGroup,
    uniform_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    white: GpuTexture,
    target: GpuTexture,
    textures: BTreeMap<TextureSlot, GpuTexture>,
    pending_clear: Option<wgpu::Color>,
    adapter_name: String,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_name)
            .field("size", &self.target.size)
            .field("textures", &self.textures.len())
            .finish()
    }
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
) -> GpuTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTexture {
        texture,
        view,
        size: (width, height),
    }
}

fn write_texture(queue: &wgpu::Queue, target: &GpuTexture, image: &RgbaImage) {
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &target.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.as_raw(),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(4 * image.width()),
            rows_per_image: Some(image.height()),
        },
        wgpu::Extent3d {
            width: image.width(),
            height: image.height(),
            depth_or_array_layers: 1,
        },
    );
}

pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

impl WgpuBackend {
    /// Pick an adapter, compile the layer shader and allocate the target.
    pub fn new(width: u32, height: u32) -> LockstepResult<Self> {
        if width == 0 || height == 0 {
            return Err(LockstepError::compositor_init(format!(
                "framebuffer size must be non-zero, got {width}x{height}"
            )));
        }

        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| LockstepError::compositor_init("no GPU adapter available"))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lockstep_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|e| LockstepError::compositor_init(format!("failed to open GPU device: {e}")))?;

        let max_dim = device.limits().max_texture_dimension_2d;
        if width > max_dim || height > max_dim {
            return Err(LockstepError::compositor_init(format!(
                "{width}x{height} exceeds the adapter limit of {max_dim}"
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("lockstep_layer_shader"),
            source: wgpu::ShaderSource::Wgsl(LAYER_SHADER.into()),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("lockstep_layer_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        };
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lockstep_texture_layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lockstep_uniform_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(
                        std::mem::size_of::<GpuLayerUniform>() as u64
                    ),
                },
                count: None,
            }],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lockstep_layer_uniform"),
            size: std::mem::size_of::<GpuLayerUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lockstep_uniform_bind_group"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("lockstep_pipeline_layout"),
            bind_group_layouts: &[&texture_layout, &uniform_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("lockstep_layer_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[wgpu::VertexAttribute {
                        offset: 0,
                        shader_location: 0,
                        format: wgpu::VertexFormat::Float32x2,
                    }],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(LockstepError::compositor_init(format!(
                "layer shader failed to build: {error}"
            )));
        }

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("lockstep_quad"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let white = create_texture(
            &device,
            "lockstep_white",
            1,
            1,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_texture(
            &queue,
            &white,
            &RgbaImage::from_pixel(1, 1, image::Rgba([255; 4])),
        );
        let target = create_texture(
            &device,
            "lockstep_target",
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );

        tracing::info!(adapter = %adapter_name, width, height, "GPU compositor initialized");

        Ok(Self {
            device,
            queue,
            pipeline,
            texture_layout,
            uniform_bind_group,
            uniform_buffer,
            vertex_buffer,
            sampler,
            white,
            target,
            textures: BTreeMap::new(),
            pending_clear: Some(wgpu::Color::TRANSPARENT),
            adapter_name,
        })
    }

    fn texture(&self, slot: TextureSlot) -> LockstepResult<&GpuTexture> {
        self.textures.get(&slot).ok_or_else(|| {
            LockstepError::compositor_init(format!("texture slot {} was never uploaded", slot.0))
        })
    }

    /// Run an empty pass so a pending clear reaches the target.
    fn flush_clear(&mut self) {
        let Some(color) = self.pending_clear.take() else {
            return;
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lockstep_clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("lockstep_clear_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn size(&self) -> (u32, u32) {
        self.target.size
    }

    fn resize(&mut self, width: u32, height: u32) -> LockstepResult<()> {
        if width == 0 || height == 0 {
            return Err(LockstepError::compositor_init(format!(
                "framebuffer size must be non-zero, got {width}x{height}"
            )));
        }
        self.target = create_texture(
            &self.device,
            "lockstep_target",
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        self.pending_clear = Some(wgpu::Color::TRANSPARENT);
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) {
        let a = color[3].clamp(0.0, 1.0) as f64;
        self.pending_clear = Some(wgpu::Color {
            r: color[0] as f64 * a,
            g: color[1] as f64 * a,
            b: color[2] as f64 * a,
            a,
        });
    }

    fn upload(&mut self, slot: TextureSlot, image: &RgbaImage) -> LockstepResult<()> {
        if image.width() == 0 || image.height() == 0 {
            return Err(LockstepError::media("cannot upload an empty frame"));
        }
        let size = image.dimensions();
        let reuse = self.textures.get(&slot).is_some_and(|t| t.size == size);
        if !reuse {
            let texture = create_texture(
                &self.device,
                "lockstep_layer_texture",
                size.0,
                size.1,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            );
            self.textures.insert(slot, texture);
        }
        let texture = self.texture(slot)?;
        write_texture(&self.queue, texture, image);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> LockstepResult<()> {
        let uniform = GpuLayerUniform::new(call.uniforms, call.matte.is_some());
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));

        let color = &self.texture(call.color)?.view;
        let matte = match call.matte {
            Some(slot) => &self.texture(slot)?.view,
            None => &self.white.view,
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lockstep_layer_bind_group"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(color),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(matte),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let load = match self.pending_clear.take() {
            Some(color) => wgpu::LoadOp::Clear(color),
            None => wgpu::LoadOp::Load,
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lockstep_layer_draw"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("lockstep_layer_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_bind_group(1, &self.uniform_bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.draw(0..QUAD_VERTICES.len() as u32, 0..1);
        }
        // One submit per layer: the uniform buffer is rewritten for the next draw.
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self) -> LockstepResult<RgbaImage> {
        self.flush_clear();

        let (width, height) = self.target.size;
        let row_bytes = width * 4;
        let aligned_row_bytes = align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lockstep_readback"),
            size: aligned_row_bytes as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lockstep_readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| LockstepError::compositor_init("GPU readback was dropped"))?
            .map_err(|e| LockstepError::compositor_init(format!("GPU readback failed: {e}")))?;

        let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(aligned_row_bytes as usize) {
                for px in row[..row_bytes as usize].chunks_exact(4) {
                    let a = px[3];
                    if a == 0 {
                        pixels.extend_from_slice(&[0, 0, 0, 0]);
                    } else {
                        let unpremultiply =
                            |c: u8| ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8;
                        pixels.extend_from_slice(&[
                            unpremultiply(px[0]),
                            unpremultiply(px[1]),
                            unpremultiply(px[2]),
                            a,
                        ]);
                    }
                }
            }
        }
        buffer.unmap();

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| LockstepError::compositor_init("readback size mismatch"))
    }

    fn release(&mut self, slot: TextureSlot) {
        self.textures.remove(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_alignment() {
        assert_eq!(align_to(4 * 64, 256), 256);
        assert_eq!(align_to(4 * 65, 256), 512);
        assert_eq!(align_to(7, 0), 7);
    }

    #[test]
    fn test_uniform_layout_is_std140_sized() {
        assert_eq!(std::mem::size_of::<GpuLayerUniform>(), 128);
    }
}
