//! Geometry and read-back buffers for the fan renderer.
//!
//! The scene is a single smoothly shaded triangle fan: six vertices around
//! the centre of the screen, each with its own colour.

use wgpu::{Buffer, BufferUsages, Device, Queue};

/// Fan vertex positions in clip space.
pub const FAN_POSITIONS: [[f32; 3]; 6] = [
    [0.0, 0.8, 0.0],
    [-0.8, 0.4, 0.0],
    [-0.6, -0.5, 0.0],
    [0.0, -0.8, 0.0],
    [0.6, -0.5, 0.0],
    [0.8, 0.4, 0.0],
];

/// Per-vertex RGBA colours: white, red, yellow, green, cyan, blue.
pub const FAN_COLORS: [[f32; 4]; 6] = [
    [1.0, 1.0, 1.0, 1.0],
    [1.0, 0.0, 0.0, 1.0],
    [1.0, 1.0, 0.0, 1.0],
    [0.0, 1.0, 0.0, 1.0],
    [0.0, 1.0, 1.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
];

/// Background colour, 0xAARRGGBB.
pub const CLEAR_COLOR_ARGB: u32 = 0xFF50_5050;

/// Row pitch of the read-back buffer; one aligned row is enough for a pixel.
const READBACK_ROW_BYTES: u64 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64;

/// A vertex as laid out in the vertex buffer.
/// Must match `VertexInput` in fan.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl Vertex {
    const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x4];

    /// Returns the vertex buffer layout for the render pipeline.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Zips positions and colours into vertices.
pub fn fan_vertices() -> Vec<Vertex> {
    FAN_POSITIONS
        .iter()
        .zip(FAN_COLORS.iter())
        .map(|(&position, &color)| Vertex { position, color })
        .collect()
}

/// Expands a triangle fan of `vertex_count` vertices into a triangle list.
///
/// wgpu has no fan topology. Triangle `i` of a fan is `(0, i, i + 1)`.
pub fn fan_indices(vertex_count: u16) -> Vec<u16> {
    (1..vertex_count.saturating_sub(1))
        .flat_map(|i| [0, i, i + 1])
        .collect()
}

/// Converts a 0xAARRGGBB colour to a wgpu clear colour.
pub fn argb_to_color(argb: u32) -> wgpu::Color {
    let channel = |shift: u32| f64::from((argb >> shift) & 0xFF) / 255.0;
    wgpu::Color {
        r: channel(16),
        g: channel(8),
        b: channel(0),
        a: channel(24),
    }
}

/// Converts a 0xAARRGGBB colour to the bytes an Rgba8Unorm target stores.
pub fn argb_to_rgba8(argb: u32) -> [u8; 4] {
    let [a, r, g, b] = argb.to_be_bytes();
    [r, g, b, a]
}

/// Owns the vertex, index and read-back buffers.
pub struct BufferManager {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    readback_buffer: Buffer,
}

impl BufferManager {
    /// Creates and uploads the fan geometry.
    pub fn new(device: &Device, queue: &Queue) -> Self {
        let vertices = fan_vertices();
        let indices = fan_indices(vertices.len() as u16);

        let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fan_vertices"),
            size: std::mem::size_of_val(vertices.as_slice()) as u64,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&vertex_buffer, 0, bytemuck::cast_slice(&vertices));

        let index_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fan_indices"),
            size: std::mem::size_of_val(indices.as_slice()) as u64,
            usage: BufferUsages::INDEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&index_buffer, 0, bytemuck::cast_slice(&indices));

        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixel_readback"),
            size: READBACK_ROW_BYTES,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            readback_buffer,
        }
    }

    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    /// Returns the number of indices to draw.
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn readback_buffer(&self) -> &Buffer {
        &self.readback_buffer
    }

    /// Returns the buffer layout used when copying a pixel into read-back.
    pub fn readback_layout(&self) -> wgpu::TexelCopyBufferLayout {
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(READBACK_ROW_BYTES as u32),
            rows_per_image: Some(1),
        }
    }
}
