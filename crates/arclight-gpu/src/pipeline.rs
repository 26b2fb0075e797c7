//! Opaque pipeline handles and a compute pipeline convenience wrapper.
//!
//! The command chain never builds pipelines itself; callers hand it a
//! [`PipelineHandle`] for whatever pipeline and layout they created.
//! [`ComputePipeline`] covers the common case of a single compute stage
//! built from SPIR-V words.

use crate::error::{GpuError, Result};
use ash::vk;

/// Pipeline reference the command chain can bind.
#[derive(Debug, Clone, Copy)]
pub struct PipelineHandle {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl PipelineHandle {
    /// Handle for a compute pipeline.
    #[must_use]
    pub fn compute(pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Self {
        Self {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }
    }

    /// Handle for a graphics pipeline.
    #[must_use]
    pub fn graphics(pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Self {
        Self {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        }
    }
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from shader code. A
    /// `push_constant_size` of zero means no push constants.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        shader_code: &[u32],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> Result<Self> {
        // Create shader module
        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;

        // Create pipeline layout
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)];
        let ranges: &[vk::PushConstantRange] = if push_constant_size == 0 { &[] } else { &ranges };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(ranges);
        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_shader_module(shader_module, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        // Create compute pipeline
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = match device.create_compute_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines,
            Err((_pipelines, e)) => {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_shader_module(shader_module, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        // Clean up shader module (no longer needed)
        device.destroy_shader_module(shader_module, None);

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    /// Handle the command chain binds.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle::compute(self.pipeline, self.layout)
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_carry_their_bind_point() {
        let compute = PipelineHandle::compute(vk::Pipeline::null(), vk::PipelineLayout::null());
        assert_eq!(compute.bind_point, vk::PipelineBindPoint::COMPUTE);

        let graphics = PipelineHandle::graphics(vk::Pipeline::null(), vk::PipelineLayout::null());
        assert_eq!(graphics.bind_point, vk::PipelineBindPoint::GRAPHICS);
    }
}
