use std::sync::{Mutex, MutexGuard};

/// 向上对齐，`align` 为 0 或 1 时原样返回
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 { value } else { value.div_ceil(align) * align }
}

/// 加锁，锁被 poison 时继续使用内部数据
///
/// 持锁期间 panic 只会发生在契约违背时，此时数据结构本身仍然是完整的
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
