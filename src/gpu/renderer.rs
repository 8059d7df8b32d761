//! Offscreen fan renderer used as a GPU load.
//!
//! Each frame follows the classic sequence: clear, draw the fan, flush the
//! commands to the GPU, swap render targets and wait for the GPU to finish.
//! There is no window; two offscreen targets stand in for a swap chain so
//! the GPU writes alternate between two regions of memory.

use crate::error::{GpuError, StressError};
use crate::gpu::buffers::{argb_to_color, argb_to_rgba8, BufferManager, CLEAR_COLOR_ARGB};
use crate::gpu::device::{select_gpu, GpuInfo};
use crate::gpu::shaders::{ShaderManager, TARGET_FORMAT};
use crate::stats::StressStats;
use crate::traits::StressLoad;
use pollster::block_on;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use wgpu::{Adapter, Device, Queue, Texture, TextureView};

/// Default render target edge, in pixels.
pub const DEFAULT_TARGET_SIZE: u32 = 512;

/// Renderer configuration.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Render target width in pixels.
    pub width: u32,
    /// Render target height in pixels.
    pub height: u32,
    /// Timeout for a frame to complete, in seconds.
    pub timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_TARGET_SIZE,
            height: DEFAULT_TARGET_SIZE,
            timeout_secs: 30,
        }
    }
}

/// One offscreen colour target.
struct Target {
    texture: Texture,
    view: TextureView,
}

/// Draws the smoothed triangle fan over and over.
pub struct FanRenderer {
    device: Device,
    queue: Queue,
    gpu_info: GpuInfo,
    shaders: ShaderManager,
    buffers: BufferManager,
    targets: [Target; 2],
    /// Index of the target holding the most recently finished frame.
    front: usize,
    width: u32,
    height: u32,
    frames: u64,
    timeout: Duration,
}

impl FanRenderer {
    /// Creates a renderer on `adapter`.
    ///
    /// # Errors
    ///
    /// Returns `GpuError::DeviceRequest` if device creation fails and
    /// `GpuError::InvalidTarget` if the target size is zero or larger than
    /// the device supports.
    pub fn new(adapter: Adapter, gpu_info: GpuInfo, config: &RenderConfig) -> Result<Self, GpuError> {
        // Mali-class GPUs only reach GLES2/WebGL2 limits.
        let limits = wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits());
        let (device, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("lima-memtester"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let max_dim = device.limits().max_texture_dimension_2d;
        if !target_size_valid(config.width, config.height, max_dim) {
            return Err(GpuError::InvalidTarget {
                width: config.width,
                height: config.height,
            });
        }

        let shaders = ShaderManager::new(&device, TARGET_FORMAT)?;
        let buffers = BufferManager::new(&device, &queue);
        let targets = [
            create_target(&device, config.width, config.height, "front_target"),
            create_target(&device, config.width, config.height, "back_target"),
        ];

        Ok(Self {
            device,
            queue,
            gpu_info,
            shaders,
            buffers,
            targets,
            front: 0,
            width: config.width,
            height: config.height,
            frames: 0,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Returns information about the GPU in use.
    pub fn gpu_info(&self) -> &GpuInfo {
        &self.gpu_info
    }

    /// Returns the number of frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Renders one frame into the back target and makes it the front.
    ///
    /// Blocks until the GPU has finished the frame.
    pub fn render_frame(&mut self) -> Result<(), GpuError> {
        let back = 1 - self.front;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fan_encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fan_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.targets[back].view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(argb_to_color(CLEAR_COLOR_ARGB)),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(self.shaders.pipeline());
            pass.set_vertex_buffer(0, self.buffers.vertex_buffer().slice(..));
            pass.set_index_buffer(
                self.buffers.index_buffer().slice(..),
                wgpu::IndexFormat::Uint16,
            );
            pass.draw_indexed(0..self.buffers.index_count(), 0, 0..1);
        }

        // Flush
        self.queue.submit(Some(encoder.finish()));

        // Swap
        self.front = back;

        // Finish
        let (tx, rx) = std::sync::mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            tx.send(()).ok();
        });
        self.wait_with_timeout(rx)?;

        self.frames += 1;
        Ok(())
    }

    /// Reads one RGBA pixel from the front target.
    pub fn read_pixel(&self, x: u32, y: u32) -> Result<[u8; 4], GpuError> {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.targets[self.front].texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: self.buffers.readback_buffer(),
                layout: self.buffers.readback_layout(),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer = self.buffers.readback_buffer();
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.wait_with_timeout(rx)?
            .map_err(|e| GpuError::BufferMapping(e.to_string()))?;

        let data = slice.get_mapped_range();
        let pixel = [data[0], data[1], data[2], data[3]];
        drop(data);
        buffer.unmap();

        Ok(pixel)
    }

    /// Returns the (corner, centre) pixels of the front target.
    pub fn sample_frame(&self) -> Result<([u8; 4], [u8; 4]), GpuError> {
        let corner = self.read_pixel(0, 0)?;
        let centre = self.read_pixel(self.width / 2, self.height / 2)?;
        Ok((corner, centre))
    }

    /// Polls the device until `rx` yields or the timeout expires.
    fn wait_with_timeout<T>(&self, rx: Receiver<T>) -> Result<T, GpuError> {
        let start = Instant::now();
        loop {
            let _ = self.device.poll(wgpu::PollType::Poll);

            if let Ok(value) = rx.try_recv() {
                return Ok(value);
            }

            if start.elapsed() > self.timeout {
                return Err(GpuError::Timeout(self.timeout.as_secs()));
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn target_size_valid(width: u32, height: u32, max_dim: u32) -> bool {
    width > 0 && height > 0 && width <= max_dim && height <= max_dim
}

fn create_target(device: &Device, width: u32, height: u32, label: &str) -> Target {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Target { texture, view }
}

/// The GPU load: renders the fan until told to stop.
pub struct GpuLoad {
    gpu_index: Option<usize>,
    config: RenderConfig,
    verbose: bool,
}

impl GpuLoad {
    pub fn new(gpu_index: Option<usize>, config: RenderConfig, verbose: bool) -> Self {
        Self {
            gpu_index,
            config,
            verbose,
        }
    }
}

impl StressLoad for GpuLoad {
    fn name(&self) -> &'static str {
        "GPU"
    }

    fn run(&mut self, stats: &StressStats, should_stop: &AtomicBool) -> Result<(), StressError> {
        let (adapter, info) = select_gpu(self.gpu_index)?;
        let mut renderer = FanRenderer::new(adapter, info, &self.config)?;
        log::info!(
            "GPU load running on {} (driver {})",
            renderer.gpu_info(),
            renderer.gpu_info().driver
        );

        while !should_stop.load(Ordering::Relaxed) {
            renderer.render_frame()?;
            stats.add_frame();

            if self.verbose && renderer.frames() == 1 {
                let (corner, centre) = renderer.sample_frame()?;
                log::info!("first frame: corner {:02x?}, centre {:02x?}", corner, centre);
                let clear = argb_to_rgba8(CLEAR_COLOR_ARGB);
                if corner != clear || centre == clear {
                    log::warn!("first frame does not show the fan over the clear colour");
                }
            }
        }

        log::debug!("GPU load stopping after {} frames", renderer.frames());
        Ok(())
    }
}
