pub mod capabilities;
pub mod clock;
pub mod device;
pub mod gpu_error;
pub mod headless_device;
