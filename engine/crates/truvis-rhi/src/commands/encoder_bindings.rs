use crate::commands::gpu_command::{SamplerHandle, ShaderStage};
use crate::foundation::device::{RawBuffer, RawTexture};

pub const MAX_BUFFER_BINDINGS: usize = 31;
pub const MAX_TEXTURE_BINDINGS: usize = 128;
pub const MAX_SAMPLER_BINDINGS: usize = 16;

/// 单个 shader stage 的绑定，按类型分成独立的数组
#[derive(Clone)]
struct StageBindings {
    buffers: [Option<RawBuffer>; MAX_BUFFER_BINDINGS],
    buffer_offsets: [u64; MAX_BUFFER_BINDINGS],
    textures: [Option<RawTexture>; MAX_TEXTURE_BINDINGS],
    samplers: [Option<SamplerHandle>; MAX_SAMPLER_BINDINGS],

    /// 每个 bit 对应一个槽位
    bound_buffers: u32,
    bound_textures: u128,
    bound_samplers: u16,
}

impl Default for StageBindings {
    fn default() -> Self {
        Self {
            buffers: [None; MAX_BUFFER_BINDINGS],
            buffer_offsets: [0; MAX_BUFFER_BINDINGS],
            textures: [None; MAX_TEXTURE_BINDINGS],
            samplers: [None; MAX_SAMPLER_BINDINGS],
            bound_buffers: 0,
            bound_textures: 0,
            bound_samplers: 0,
        }
    }
}

/// encoder 上当前已绑定的资源，用于去掉重复的绑定调用
#[derive(Clone, Default)]
pub struct EncoderBindings {
    stages: [StageBindings; ShaderStage::COUNT],
}

impl EncoderBindings {
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.bound_buffers = 0;
            stage.bound_textures = 0;
            stage.bound_samplers = 0;
        }
    }

    /// 返回是否发生了变化，未变化时调用方可以跳过底层绑定
    pub fn set_buffer(&mut self, stage: ShaderStage, index: u32, buffer: RawBuffer, offset: u64) -> bool {
        let i = index as usize;
        assert!(i < MAX_BUFFER_BINDINGS, "buffer binding index {index} out of range");
        let bindings = &mut self.stages[stage.index()];
        let bit = 1u32 << i;
        if bindings.bound_buffers & bit != 0 && bindings.buffers[i] == Some(buffer) && bindings.buffer_offsets[i] == offset
        {
            return false;
        }
        bindings.buffers[i] = Some(buffer);
        bindings.buffer_offsets[i] = offset;
        bindings.bound_buffers |= bit;
        true
    }

    pub fn set_texture(&mut self, stage: ShaderStage, index: u32, texture: RawTexture) -> bool {
        let i = index as usize;
        assert!(i < MAX_TEXTURE_BINDINGS, "texture binding index {index} out of range");
        let bindings = &mut self.stages[stage.index()];
        let bit = 1u128 << i;
        if bindings.bound_textures & bit != 0 && bindings.textures[i] == Some(texture) {
            return false;
        }
        bindings.textures[i] = Some(texture);
        bindings.bound_textures |= bit;
        true
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, index: u32, sampler: SamplerHandle) -> bool {
        let i = index as usize;
        assert!(i < MAX_SAMPLER_BINDINGS, "sampler binding index {index} out of range");
        let bindings = &mut self.stages[stage.index()];
        let bit = 1u16 << i;
        if bindings.bound_samplers & bit != 0 && bindings.samplers[i] == Some(sampler) {
            return false;
        }
        bindings.samplers[i] = Some(sampler);
        bindings.bound_samplers |= bit;
        true
    }

    pub fn buffer(&self, stage: ShaderStage, index: u32) -> Option<(RawBuffer, u64)> {
        let bindings = &self.stages[stage.index()];
        let i = index as usize;
        if i >= MAX_BUFFER_BINDINGS || bindings.bound_buffers & (1 << i) == 0 {
            return None;
        }
        bindings.buffers[i].map(|buffer| (buffer, bindings.buffer_offsets[i]))
    }

    pub fn texture(&self, stage: ShaderStage, index: u32) -> Option<RawTexture> {
        let bindings = &self.stages[stage.index()];
        let i = index as usize;
        if i >= MAX_TEXTURE_BINDINGS || bindings.bound_textures & (1 << i) == 0 {
            return None;
        }
        bindings.textures[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_and_reset() {
        let mut bindings = EncoderBindings::default();
        assert!(bindings.set_buffer(ShaderStage::Vertex, 3, RawBuffer(7), 0));
        assert!(!bindings.set_buffer(ShaderStage::Vertex, 3, RawBuffer(7), 0));
        assert!(bindings.set_buffer(ShaderStage::Vertex, 3, RawBuffer(7), 256));
        // 不同 stage 互不影响
        assert!(bindings.set_buffer(ShaderStage::Fragment, 3, RawBuffer(7), 256));
        assert_eq!(bindings.buffer(ShaderStage::Vertex, 3), Some((RawBuffer(7), 256)));

        assert!(bindings.set_texture(ShaderStage::Fragment, 100, RawTexture(1)));
        assert!(!bindings.set_texture(ShaderStage::Fragment, 100, RawTexture(1)));
        assert!(bindings.set_sampler(ShaderStage::Fragment, 15, SamplerHandle(2)));

        bindings.reset();
        assert_eq!(bindings.buffer(ShaderStage::Vertex, 3), None);
        assert_eq!(bindings.texture(ShaderStage::Fragment, 100), None);
        assert!(bindings.set_buffer(ShaderStage::Vertex, 3, RawBuffer(7), 256));
    }
}
