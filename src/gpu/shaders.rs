//! WGSL shader and render pipeline for the fan renderer.

use crate::error::GpuError;
use crate::gpu::buffers::Vertex;
use wgpu::{Device, RenderPipeline, TextureFormat};

/// WGSL source for the fan vertex and fragment shaders.
pub const FAN_WGSL: &str = include_str!("../shaders/fan.wgsl");

/// Colour format of the offscreen render targets.
pub const TARGET_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Compiled shaders linked into a render pipeline.
pub struct ShaderManager {
    pipeline: RenderPipeline,
}

impl ShaderManager {
    /// Compiles the fan shaders and links them for `format` targets.
    ///
    /// # Panics
    ///
    /// wgpu reports shader compilation and pipeline validation failures
    /// through the device's uncaptured error handler, which panics by
    /// default. They are not returned as `GpuError`.
    pub fn new(device: &Device, format: TextureFormat) -> Result<Self, GpuError> {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fan_shader"),
            source: wgpu::ShaderSource::Wgsl(FAN_WGSL.into()),
        });

        // No bind groups: everything the shaders need arrives as vertex attributes.
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fan_pipeline_layout"),
            bind_group_layouts: &[],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("fan_pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[Vertex::layout()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self { pipeline })
    }

    /// Returns the linked render pipeline.
    pub fn pipeline(&self) -> &RenderPipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::select_gpu;
    use pollster::block_on;

    fn setup_device() -> Option<wgpu::Device> {
        let (adapter, _info) = select_gpu(None).ok()?;

        let (device, _queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("test device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_webgl2_defaults(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .ok()?;

        Some(device)
    }

    #[test]
    fn test_shader_source_entry_points() {
        assert!(FAN_WGSL.contains("fn vs_main"));
        assert!(FAN_WGSL.contains("fn fs_main"));
        assert!(FAN_WGSL.contains("@location(1) color"));
    }

    #[test]
    fn test_fan_shader_compilation() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping shader compilation test");
            return;
        };

        // Should not panic
        let _module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fan"),
            source: wgpu::ShaderSource::Wgsl(FAN_WGSL.into()),
        });
    }

    #[test]
    fn test_shader_manager_creation() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping shader manager test");
            return;
        };

        let manager = ShaderManager::new(&device, TARGET_FORMAT);
        assert!(manager.is_ok());
        let _ = manager.unwrap().pipeline();
    }
}
