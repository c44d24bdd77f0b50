use std::sync::{Arc, Mutex};

use crate::commands::command_buffer::CommandBuffer;
use crate::commands::fence::Fence;
use crate::foundation::capabilities::{GpuCapabilities, GpuFeatures};
use crate::foundation::device::{GpuDevice, RawCommandBuffer};
use crate::foundation::gpu_error::{CommandBufferStatus, report_command_buffer_error};
use crate::settings::{CommandDebugLevel, CommandSettings};
use crate::utilities::lock;

/// 并行 context 的提交槽位
#[derive(Default)]
struct ParallelSubmission {
    slots: Vec<Option<Vec<CommandBuffer>>>,
    filled: usize,
}

/// 设备唯一的串行提交通道
pub struct CommandQueue {
    device: Arc<dyn GpuDevice>,
    settings: CommandSettings,
    parallel: Mutex<ParallelSubmission>,
}

// new & init
impl CommandQueue {
    pub fn new(device: Arc<dyn GpuDevice>, settings: CommandSettings) -> Self {
        log::info!("command queue created, debug level {:?}", settings.debug_level);
        Self {
            device,
            settings,
            parallel: Mutex::new(ParallelSubmission::default()),
        }
    }
}

// getters
impl CommandQueue {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[inline]
    pub fn capabilities(&self) -> &GpuCapabilities {
        self.device.capabilities()
    }

    #[inline]
    pub fn supports_feature(&self, feature: GpuFeatures) -> bool {
        self.capabilities().supports(feature)
    }

    #[inline]
    pub fn debug_level(&self) -> CommandDebugLevel {
        self.settings.debug_level
    }

    #[inline]
    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }
}

// tools
impl CommandQueue {
    pub fn create_command_buffer(&self, label: &str) -> CommandBuffer {
        if self.settings.debug_level >= CommandDebugLevel::Logging {
            log::trace!("create command buffer '{label}'");
        }
        CommandBuffer::new(self.device.clone(), label).with_debug_level(self.settings.debug_level)
    }

    /// 平台不支持 fence 时返回空 fence
    pub fn create_fence(&self, label: &str) -> Fence {
        if !self.supports_feature(GpuFeatures::FENCES) {
            return Fence::null(self.device.clone(), label);
        }
        Fence::new(self.device.clone(), self.device.new_fence(label), label)
    }

    /// 立即提交
    ///
    /// Validation 级别下同步等待 GPU 完成并检查错误；其他级别在 completion handler 中检查。
    pub fn commit_command_buffer(&self, mut command_buffer: CommandBuffer) {
        let _span = tracy_client::span!("CommandQueue::commit_command_buffer");
        let platform = self.capabilities().platform;
        let raw = command_buffer.raw();
        let label = command_buffer.label().to_string();
        let debug_groups = command_buffer.debug_groups().to_vec();

        if self.settings.debug_level >= CommandDebugLevel::Logging {
            log::debug!("commit '{label}'");
        }

        if self.settings.debug_level == CommandDebugLevel::Validation {
            self.device.commit(raw, command_buffer.take_completion_handlers());
            if let CommandBufferStatus::Error(kind) = self.device.wait_until_completed(raw) {
                report_command_buffer_error(kind, &label, &debug_groups, platform);
            }
        } else {
            command_buffer.add_completion_handler(move |status| {
                if let CommandBufferStatus::Error(kind) = status {
                    report_command_buffer_error(kind, &label, &debug_groups, platform);
                }
            });
            self.device.commit(raw, command_buffer.take_completion_handlers());
        }
    }

    pub fn wait_until_completed(&self, command_buffer: RawCommandBuffer) -> CommandBufferStatus {
        self.device.wait_until_completed(command_buffer)
    }

    /// 并行 context 的有序提交
    ///
    /// 把 `command_buffers` 放到 `index` 槽位；最后一个到达的调用者按槽位顺序提交全部 command buffer 并重置槽位。
    pub fn submit_command_buffers(&self, command_buffers: Vec<CommandBuffer>, index: usize, count: usize) {
        let _span = tracy_client::span!("CommandQueue::submit_command_buffers");
        assert!(index < count, "parallel submission index {index} out of range {count}");

        let mut parallel = lock(&self.parallel);
        if parallel.slots.is_empty() {
            parallel.slots.resize_with(count, || None);
        }
        assert_eq!(parallel.slots.len(), count, "parallel submission count changed within one batch");
        assert!(parallel.slots[index].is_none(), "parallel slot {index} submitted twice");

        parallel.slots[index] = Some(command_buffers);
        parallel.filled += 1;
        if parallel.filled < count {
            return;
        }

        let slots = std::mem::take(&mut parallel.slots);
        parallel.filled = 0;
        log::debug!("submitting {count} parallel command lists");
        for command_buffer in slots.into_iter().flatten().flatten() {
            self.commit_command_buffer(command_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::capabilities::PlatformClass;
    use crate::foundation::gpu_error::GpuErrorKind;
    use crate::foundation::headless_device::HeadlessDevice;

    fn queue(capabilities: GpuCapabilities, debug_level: CommandDebugLevel) -> (Arc<HeadlessDevice>, CommandQueue) {
        let headless = Arc::new(HeadlessDevice::new(capabilities));
        let settings = CommandSettings {
            debug_level,
            ..Default::default()
        };
        (headless.clone(), CommandQueue::new(headless, settings))
    }

    #[test]
    fn test_parallel_slots_commit_in_index_order() {
        let (headless, queue) = queue(GpuCapabilities::desktop(), CommandDebugLevel::Off);

        let make = |name: &str| vec![queue.create_command_buffer(name)];
        queue.submit_command_buffers(make("2"), 2, 3);
        queue.submit_command_buffers(make("0"), 0, 3);
        assert!(headless.executed_labels().is_empty());
        queue.submit_command_buffers(make("1"), 1, 3);
        assert_eq!(headless.executed_labels(), vec!["0", "1", "2"]);

        // 槽位已重置，下一批可以使用不同的数量
        queue.submit_command_buffers(make("solo"), 0, 1);
        assert_eq!(headless.executed_labels().last().map(String::as_str), Some("solo"));
    }

    #[test]
    fn test_command_buffers_carry_debug_level() {
        let (_, queue) = queue(GpuCapabilities::desktop(), CommandDebugLevel::Validation);
        let mut cb = queue.create_command_buffer("tracked");
        assert_eq!(cb.debug_level(), CommandDebugLevel::Validation);
        cb.push_debug_group("gbuffer");
        assert_eq!(cb.debug_groups(), ["gbuffer".to_string()]);
        cb.pop_debug_group();
        queue.commit_command_buffer(cb);
    }

    #[test]
    fn test_null_fence_without_fence_support() {
        let (headless, queue) = queue(GpuCapabilities::minimal(PlatformClass::Desktop), CommandDebugLevel::Off);
        assert!(queue.create_fence("f").is_null());
        assert_eq!(headless.live_fence_count(), 0);
        assert!(!queue.supports_feature(GpuFeatures::HEAPS));
    }

    #[test]
    fn test_non_fatal_error_is_logged_in_handler() {
        truvis_crate_tools::init_log::init_test_log();
        let (headless, queue) = queue(GpuCapabilities::mobile(), CommandDebugLevel::Logging);
        headless.inject_error(GpuErrorKind::Timeout);
        queue.commit_command_buffer(queue.create_command_buffer("mobile timeout"));
        assert!(headless.executed_command_buffers()[0].status.is_error());
    }

    #[test]
    #[should_panic(expected = "fatal GPU error Blacklisted")]
    fn test_validation_reports_fatal_error() {
        let (headless, queue) = queue(GpuCapabilities::desktop(), CommandDebugLevel::Validation);
        headless.set_auto_complete(false);
        headless.inject_error(GpuErrorKind::Blacklisted);
        queue.commit_command_buffer(queue.create_command_buffer("blacklisted"));
    }
}
