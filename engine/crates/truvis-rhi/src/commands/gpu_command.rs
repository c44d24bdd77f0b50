use crate::commands::render_pass_desc::{RenderPassDescriptor, StoreActions};
use crate::foundation::device::{RawBuffer, RawFence, RawTexture};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    Render,
    Compute,
    Blit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

/// 由上层 pipeline 缓存创建，对 RHI 是不透明的
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 写入 command buffer 的底层命令
///
/// 设备实现按顺序解释这些命令，encoder 的开始 / 结束也是命令流的一部分。
#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    BeginRenderEncoder { label: String, descriptor: RenderPassDescriptor },
    BeginComputeEncoder { label: String },
    BeginBlitEncoder { label: String },
    EndEncoding,

    WaitForFence(RawFence),
    UpdateFence(RawFence),
    SetStoreActions(StoreActions),

    SetRenderPipeline(PipelineHandle),
    SetComputePipeline(PipelineHandle),
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetBuffer { stage: ShaderStage, index: u32, buffer: RawBuffer, offset: u64 },
    SetTexture { stage: ShaderStage, index: u32, texture: RawTexture },
    SetSampler { stage: ShaderStage, index: u32, sampler: SamplerHandle },

    Draw { primitive: PrimitiveType, vertex_start: u32, vertex_count: u32, instance_count: u32 },
    DrawIndexed {
        primitive: PrimitiveType,
        index_type: IndexType,
        index_buffer: RawBuffer,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
    },
    DrawPatches { control_points: u32, patch_start: u32, patch_count: u32, instance_count: u32 },
    Dispatch { groups: [u32; 3], threads_per_group: [u32; 3] },

    CopyBuffer { src: RawBuffer, src_offset: u64, dst: RawBuffer, dst_offset: u64, size: u64 },
    CopyTexture { src: RawTexture, dst: RawTexture },

    PushDebugGroup(String),
    PopDebugGroup,
}

impl GpuCommand {
    #[inline]
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. } | Self::DrawPatches { .. })
    }
}
