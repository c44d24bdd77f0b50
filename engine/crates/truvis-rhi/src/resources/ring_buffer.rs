use std::sync::{Arc, Mutex};

use crate::commands::command_buffer::CommandBuffer;
use crate::foundation::device::{GpuDevice, RawBuffer};
use crate::resources::resource_desc::ResourceOptions;
use crate::settings::RingBufferSettings;
use crate::utilities::{align_up, lock};

/// ring buffer 中的一段临时内存，在使用它的 command buffer 完成之前有效
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingAllocation {
    pub buffer: RawBuffer,
    pub offset: u64,
    pub size: u64,
}

struct RetiredBacking {
    raw: RawBuffer,
    /// 序号不小于该值的提交完成后即可释放
    release_after_commit: u64,
}

struct RingState {
    backing: RawBuffer,
    capacity: u64,
    generation: u64,

    write_offset: u64,
    /// GPU 已经消费到的位置，由 completion handler 写入
    read_offset: u64,

    commit_count: u64,
    retired: Vec<RetiredBacking>,

    frame_usage: u64,
    peak_usage: u64,
    frames_since_shrink: u32,
}

/// 单个 backing buffer 上的环形分配器，用于每个 draw call 的临时 uniform 数据
///
/// 分配只向前推进；绕回开头时不能越过 GPU 尚未消费的区域，空间不足时扩容而不是覆盖。
/// 由单个 command encoder 独占，drop 时 GPU 必须已经空闲。
pub struct RingBuffer {
    device: Arc<dyn GpuDevice>,
    options: ResourceOptions,
    settings: RingBufferSettings,
    state: Arc<Mutex<RingState>>,
}

// new & init
impl RingBuffer {
    pub fn new(device: Arc<dyn GpuDevice>, settings: RingBufferSettings, options: ResourceOptions) -> Self {
        let capacity = settings.initial_size.max(settings.default_alignment).max(1);
        let backing = new_backing(device.as_ref(), capacity, options);
        Self {
            device,
            options,
            settings,
            state: Arc::new(Mutex::new(RingState {
                backing,
                capacity,
                generation: 0,
                write_offset: 0,
                read_offset: 0,
                commit_count: 0,
                retired: Vec::new(),
                frame_usage: 0,
                peak_usage: 0,
                frames_since_shrink: 0,
            })),
        }
    }
}

fn new_backing(device: &dyn GpuDevice, size: u64, options: ResourceOptions) -> RawBuffer {
    match device.new_buffer(size, options) {
        Some(raw) => raw,
        None => {
            log::error!("ring buffer: device out of memory allocating {size} bytes");
            panic!("ring buffer backing allocation of {size} bytes failed");
        }
    }
}

// getters
impl RingBuffer {
    pub fn capacity(&self) -> u64 {
        lock(&self.state).capacity
    }

    pub fn backing(&self) -> RawBuffer {
        lock(&self.state).backing
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn write_offset(&self) -> u64 {
        lock(&self.state).write_offset
    }

    pub fn read_offset(&self) -> u64 {
        lock(&self.state).read_offset
    }

    pub fn retired_count(&self) -> usize {
        lock(&self.state).retired.len()
    }
}

// tools
impl RingBuffer {
    /// 分配 `size` 字节，`alignment` 为 0 时使用默认对齐
    pub fn allocate(&self, size: u64, alignment: u64) -> RingAllocation {
        let _span = tracy_client::span!("RingBuffer::allocate");
        let alignment = if alignment == 0 { self.settings.default_alignment } else { alignment };
        let size = size.max(1);

        let mut state = lock(&self.state);
        let offset = match Self::find_offset(&state, size, alignment) {
            Some(offset) => offset,
            None => {
                self.grow(&mut state, size);
                0
            }
        };

        let padding = offset.saturating_sub(state.write_offset);
        state.frame_usage += padding + size;
        state.write_offset = offset + size;
        RingAllocation {
            buffer: state.backing,
            offset,
            size,
        }
    }

    /// 在 [write, end) 和 [0, read) 中查找，写指针不能追上读指针
    fn find_offset(state: &RingState, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(state.write_offset, alignment);
        if state.write_offset >= state.read_offset {
            if aligned + size <= state.capacity {
                Some(aligned)
            } else if size < state.read_offset {
                Some(0)
            } else {
                None
            }
        } else if aligned + size < state.read_offset {
            Some(aligned)
        } else {
            None
        }
    }

    fn grow(&self, state: &mut RingState, size: u64) {
        let new_capacity = align_up(state.capacity + size, self.settings.growth_granularity);
        log::debug!("ring buffer grows {} -> {} bytes", state.capacity, new_capacity);
        self.replace_backing(state, new_capacity);
    }

    fn replace_backing(&self, state: &mut RingState, new_capacity: u64) {
        let backing = new_backing(self.device.as_ref(), new_capacity, self.options);
        let old = std::mem::replace(&mut state.backing, backing);
        state.retired.push(RetiredBacking {
            raw: old,
            release_after_commit: state.commit_count + 1,
        });
        state.capacity = new_capacity;
        state.generation += 1;
        state.write_offset = 0;
        state.read_offset = 0;
    }

    /// 分配并写入数据
    pub fn upload(&self, data: &[u8], alignment: u64) -> RingAllocation {
        let allocation = self.allocate(data.len() as u64, alignment);
        self.device.write_buffer(allocation.buffer, allocation.offset, data);
        allocation
    }

    /// 注册 completion handler：GPU 完成后把读指针推进到提交时的写指针，并释放退役的 backing
    pub fn commit(&self, command_buffer: &mut CommandBuffer) {
        let (generation, offset, commit_index) = {
            let mut state = lock(&self.state);
            state.commit_count += 1;
            (state.generation, state.write_offset, state.commit_count)
        };

        let state = self.state.clone();
        let device = self.device.clone();
        command_buffer.add_completion_handler(move |_| {
            let released = {
                let mut state = lock(&state);
                if state.generation == generation {
                    state.read_offset = offset;
                }
                let (released, retained): (Vec<_>, Vec<_>) =
                    state.retired.drain(..).partition(|r| r.release_after_commit <= commit_index);
                state.retired = retained;
                released
            };
            for retired in released {
                device.release_buffer(retired.raw);
            }
        });
    }

    /// 每帧调用一次，每隔 `shrink_interval_frames` 帧根据峰值用量缩小
    pub fn shrink(&self) {
        let mut state = lock(&self.state);
        state.peak_usage = state.peak_usage.max(state.frame_usage);
        state.frame_usage = 0;
        state.frames_since_shrink += 1;
        if state.frames_since_shrink < self.settings.shrink_interval_frames {
            return;
        }

        let peak = std::mem::take(&mut state.peak_usage);
        state.frames_since_shrink = 0;

        let three_quarters = state.capacity / 4 * 3;
        if peak >= three_quarters {
            return;
        }
        let new_capacity = align_up(
            three_quarters.max(self.settings.initial_size).max(peak),
            self.settings.default_alignment,
        );
        if new_capacity >= state.capacity {
            return;
        }
        log::debug!("ring buffer shrinks {} -> {} bytes (peak {peak})", state.capacity, new_capacity);
        self.replace_backing(&mut state, new_capacity);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for retired in state.retired.drain(..) {
            self.device.release_buffer(retired.raw);
        }
        self.device.release_buffer(state.backing);
    }
}
