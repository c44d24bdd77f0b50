use truvis_rhi::foundation::device::GpuDevice;

/// 按帧触发 GPU capture
///
/// `trigger_capture(n)` 之后的 n 帧，每帧都被包在一个设备 capture scope 里。
#[derive(Debug, Default)]
pub struct CaptureManager {
    pending_frames: u32,
    active: bool,
}

impl CaptureManager {
    pub fn trigger_capture(&mut self, frames: u32) {
        log::info!("capturing the next {frames} frame(s)");
        self.pending_frames += frames;
    }

    #[inline]
    pub fn pending_frames(&self) -> u32 {
        self.pending_frames
    }

    #[inline]
    pub fn is_capturing(&self) -> bool {
        self.active
    }

    pub fn begin_frame(&mut self, device: &dyn GpuDevice, frame_name: &str) {
        if self.pending_frames == 0 || self.active {
            return;
        }
        device.begin_capture_scope(&format!("capture {frame_name}"));
        self.active = true;
    }

    pub fn end_frame(&mut self, device: &dyn GpuDevice) {
        if !self.active {
            return;
        }
        device.end_capture_scope();
        self.active = false;
        self.pending_frames -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use truvis_rhi::foundation::capabilities::GpuCapabilities;
    use truvis_rhi::foundation::headless_device::HeadlessDevice;

    #[test]
    fn test_capture_brackets_frames() {
        let device = HeadlessDevice::new(GpuCapabilities::desktop());
        let mut capture = CaptureManager::default();
        capture.trigger_capture(2);
        for frame in 0..3 {
            let name = format!("[F{frame}]");
            capture.begin_frame(&device, &name);
            capture.end_frame(&device);
        }
        assert_eq!(device.captures(), ["capture [F0]".to_string(), "capture [F1]".to_string()]);
        assert_eq!(capture.pending_frames(), 0);
        assert!(!capture.is_capturing());
    }
}
