use std::fmt;
use std::sync::{Arc, Mutex};

use crate::foundation::device::{GpuDevice, RawFence};
use crate::utilities::lock;

struct FenceInner {
    raw: Option<RawFence>,
    label: String,
    device: Arc<dyn GpuDevice>,
    /// update 过该 fence 的 encoder
    updating: Mutex<Vec<String>>,
    /// wait 过该 fence 的 encoder
    waiting: Mutex<Vec<String>>,
}

/// GPU fence 的引用计数句柄
///
/// `clone` 共享同一个底层 fence，最后一个持有者释放时归还给设备。
/// 不支持 fence 的平台上 raw 为 `None`，所有操作都是空操作。
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

// new & init
impl Fence {
    pub fn new(device: Arc<dyn GpuDevice>, raw: Option<RawFence>, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                raw,
                label: label.into(),
                device,
                updating: Mutex::new(Vec::new()),
                waiting: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn null(device: Arc<dyn GpuDevice>, label: impl Into<String>) -> Self {
        Self::new(device, None, label)
    }
}

// getters
impl Fence {
    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn raw(&self) -> Option<RawFence> {
        self.inner.raw
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.raw.is_none()
    }

    /// 两个句柄是否指向同一个 fence
    #[inline]
    pub fn same(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn updating_encoders(&self) -> Vec<String> {
        lock(&self.inner.updating).clone()
    }

    pub fn waiting_encoders(&self) -> Vec<String> {
        lock(&self.inner.waiting).clone()
    }

    /// 被 update 过的 fence 至少要被 wait 一次
    pub fn is_balanced(&self) -> bool {
        lock(&self.inner.updating).is_empty() || !lock(&self.inner.waiting).is_empty()
    }
}

// tools
impl Fence {
    pub fn add_updating_encoder(&self, encoder_label: &str) {
        lock(&self.inner.updating).push(encoder_label.to_string());
    }

    pub fn add_waiting_encoder(&self, encoder_label: &str) {
        lock(&self.inner.waiting).push(encoder_label.to_string());
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence").field("label", &self.inner.label).field("raw", &self.inner.raw).finish()
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        let Some(raw) = self.raw else {
            return;
        };

        let updating = self.updating.get_mut().unwrap_or_else(|e| e.into_inner());
        let waiting = self.waiting.get_mut().unwrap_or_else(|e| e.into_inner());
        if !updating.is_empty() && waiting.is_empty() {
            log::error!(
                "fence '{}' was updated by [{}] but never waited on",
                self.label,
                updating.join(", ")
            );
        }

        self.device.release_fence(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::capabilities::{GpuCapabilities, PlatformClass};
    use crate::foundation::headless_device::HeadlessDevice;

    #[test]
    fn test_last_clone_releases_raw_fence() {
        let headless = Arc::new(HeadlessDevice::new(GpuCapabilities::desktop()));
        let device: Arc<dyn GpuDevice> = headless.clone();

        let fence = Fence::new(device.clone(), device.new_fence("pass"), "pass");
        let shared = fence.clone();
        assert!(fence.same(&shared));
        assert_eq!(headless.live_fence_count(), 1);

        fence.add_updating_encoder("render");
        assert!(!shared.is_balanced());
        shared.add_waiting_encoder("compute");
        assert!(fence.is_balanced());

        drop(fence);
        assert_eq!(headless.live_fence_count(), 1);
        drop(shared);
        assert_eq!(headless.live_fence_count(), 0);
    }

    #[test]
    fn test_null_fence() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(GpuCapabilities::minimal(PlatformClass::Mobile)));
        let fence = Fence::null(device, "null");
        assert!(fence.is_null());
        fence.add_updating_encoder("render");
        drop(fence);
    }
}
