use std::sync::Arc;

use anyhow::Context;
use rayon::prelude::*;
use truvis_crate_tools::init_log::init_log;
use truvis_crate_tools::resource::TruvisPath;
use truvis_render_interface::device_context::DeviceContext;
use truvis_render_interface::state_cache::{ColorTarget, DepthStencilTarget, RenderTargetsInfo};
use truvis_rhi::commands::fence::Fence;
use truvis_rhi::commands::gpu_command::{PipelineHandle, PrimitiveType, ShaderStage, Viewport};
use truvis_rhi::foundation::capabilities::{GpuCapabilities, PlatformClass};
use truvis_rhi::foundation::headless_device::HeadlessDevice;
use truvis_rhi::resources::handles::TextureHandle;
use truvis_rhi::resources::resource_desc::{ResourceOptions, TextureDesc};
use truvis_rhi::settings::RhiSettings;

const PARALLEL_BATCHES: usize = 4;

struct Args {
    platform: PlatformClass,
    frames: u64,
}

impl Args {
    /// `truvis-headless-app [desktop|mobile] [frames]`
    fn parse() -> anyhow::Result<Self> {
        let mut args = std::env::args().skip(1);
        let platform = match args.next().as_deref() {
            None | Some("desktop") => PlatformClass::Desktop,
            Some("mobile") => PlatformClass::Mobile,
            Some(other) => anyhow::bail!("unknown platform `{other}`, expected desktop or mobile"),
        };
        let frames = match args.next() {
            Some(frames) => frames.parse().with_context(|| format!("invalid frame count `{frames}`"))?,
            None => 8,
        };
        Ok(Self { platform, frames })
    }
}

struct Targets {
    color: TextureHandle,
    depth: TextureHandle,
}

fn load_settings(platform: PlatformClass) -> anyhow::Result<RhiSettings> {
    let path = TruvisPath::config_path("rhi.toml");
    if !path.exists() {
        log::warn!("{} not found, using {:?} defaults", path.display(), platform);
        return Ok(RhiSettings::for_platform(platform));
    }
    log::info!("loading rhi settings from {}", path.display());
    RhiSettings::load(&path, platform)
}

fn draw_frame(ctx: &mut DeviceContext, targets: &Targets, frame: u64) {
    let _span = tracy_client::span!("draw_frame");

    // 每帧一个临时 uniform buffer，延迟释放
    let uniforms = ctx.create_buffer(256, ResourceOptions::SHARED_WRITE_COMBINED);
    let uniform_binding = ctx.buffer_binding(uniforms);

    // 并行批次先于立即 context 提交，由之后开始的 encoder 等待
    let pool = ctx.parallel_contexts().clone();
    let fences: Vec<Option<Fence>> = (0..PARALLEL_BATCHES)
        .into_par_iter()
        .map(|index| {
            let mut parallel = pool.acquire(index, PARALLEL_BATCHES, None);
            let pass = parallel.render_pass_mut();
            pass.push_debug_group(&format!("batch {index}"));
            pass.state_mut().set_compute_pipeline(PipelineHandle(3));
            pass.dispatch([4, 1, 1], [64, 1, 1]);
            pass.pop_debug_group();
            pool.release(parallel)
        })
        .collect();
    for fence in fences.into_iter().flatten() {
        ctx.render_pass_mut().wait(fence);
    }

    let color = ctx.texture_binding(targets.color);
    let depth = ctx.texture_binding(targets.depth);
    let pass = ctx.render_pass_mut();
    pass.push_debug_group(&format!("frame {frame}"));
    pass.begin_render_pass(RenderTargetsInfo {
        colors: vec![ColorTarget::new(color).with_clear([0.1, 0.1, 0.1, 1.0])],
        depth_stencil: Some(DepthStencilTarget::new(depth)),
        ..Default::default()
    });
    {
        let state = pass.state_mut();
        state.set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: 1280.0,
            height: 720.0,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        state.set_render_pipeline(PipelineHandle(1));
        state.set_shader_buffer(ShaderStage::Vertex, 0, uniform_binding.buffer, uniform_binding.offset);
    }
    pass.draw_primitive(PrimitiveType::Triangle, 0, 3, 1);

    // 中途的 compute 会打断 render pass，之后以 Load 继续
    pass.state_mut().set_compute_pipeline(PipelineHandle(2));
    pass.dispatch([16, 16, 1], [8, 8, 1]);
    pass.draw_patches(4, 0, 64, 1);
    pass.draw_primitive(PrimitiveType::Triangle, 3, 3, 1);
    pass.end_render_pass();
    pass.pop_debug_group();

    ctx.release_buffer(uniforms);
}

fn main() -> anyhow::Result<()> {
    init_log();
    let args = Args::parse()?;
    let settings = load_settings(args.platform)?;
    let capabilities = match args.platform {
        PlatformClass::Desktop => GpuCapabilities::desktop(),
        PlatformClass::Mobile => GpuCapabilities::mobile(),
    };

    let device = Arc::new(HeadlessDevice::new(capabilities));
    let mut ctx = DeviceContext::new(device.clone(), settings);

    let targets = Targets {
        color: ctx.create_texture(&TextureDesc::new_render_target(1280, 720, 4)),
        depth: ctx.create_texture(&TextureDesc::new_render_target(1280, 720, 4)),
    };

    for frame in 0..args.frames {
        ctx.begin_frame();
        draw_frame(&mut ctx, &targets, frame);
        ctx.end_frame();

        let stats = ctx.heap_stats();
        log::info!(
            "frame {} done: {} regions, {} bytes reserved, {} bytes used",
            frame,
            stats.region_count,
            stats.reserved_bytes,
            stats.used_bytes
        );
    }

    ctx.release_texture(targets.color);
    ctx.release_texture(targets.depth);
    ctx.destroy();

    let violations = device.fence_violations();
    log::info!(
        "{} command buffers executed, {} heaps still alive",
        device.executed_command_buffers().len(),
        device.live_heap_count()
    );
    if !violations.is_empty() {
        anyhow::bail!("fence violations: {violations:?}");
    }
    Ok(())
}
