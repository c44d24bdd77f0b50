use std::ops::Range;

use crate::utilities::align_up;

/// region 内部的 first-fit 子分配器，释放时合并相邻空闲段
#[derive(Clone, Debug)]
pub struct RangeAllocator {
    size: u64,
    /// 按起点升序、互不相邻的空闲段
    free: Vec<Range<u64>>,
}

impl RangeAllocator {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            free: if size > 0 { vec![0..size] } else { Vec::new() },
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.end - r.start).sum()
    }

    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.size - self.free_bytes()
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let size = size.max(1);
        let (index, start) = self.free.iter().enumerate().find_map(|(i, range)| {
            let start = align_up(range.start, alignment);
            (start + size <= range.end).then_some((i, start))
        })?;

        let range = self.free.remove(index);
        let mut insert_at = index;
        if range.start < start {
            self.free.insert(insert_at, range.start..start);
            insert_at += 1;
        }
        if start + size < range.end {
            self.free.insert(insert_at, start + size..range.end);
        }
        Some(start)
    }

    pub fn free(&mut self, offset: u64, size: u64) {
        let size = size.max(1);
        let end = offset + size;
        assert!(end <= self.size, "free of [{offset}, {end}) outside of {} bytes", self.size);

        let index = self.free.partition_point(|r| r.start < offset);
        let overlaps_prev = index > 0 && self.free[index - 1].end > offset;
        let overlaps_next = index < self.free.len() && self.free[index].start < end;
        assert!(!overlaps_prev && !overlaps_next, "double free of [{offset}, {end})");

        let merge_prev = index > 0 && self.free[index - 1].end == offset;
        let merge_next = index < self.free.len() && self.free[index].start == end;
        match (merge_prev, merge_next) {
            (true, true) => {
                self.free[index - 1].end = self.free[index].end;
                self.free.remove(index);
            }
            (true, false) => self.free[index - 1].end = end,
            (false, true) => self.free[index].start = offset,
            (false, false) => self.free.insert(index, offset..end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_with_alignment() {
        let mut ranges = RangeAllocator::new(1024);
        assert_eq!(ranges.allocate(100, 256), Some(0));
        assert_eq!(ranges.allocate(100, 256), Some(256));
        assert_eq!(ranges.allocate(600, 256), None);
        assert_eq!(ranges.allocate(512, 256), Some(512));
        assert_eq!(ranges.used_bytes(), 100 + 100 + 512);
    }

    #[test]
    fn test_free_coalesces() {
        let mut ranges = RangeAllocator::new(300);
        let a = ranges.allocate(100, 1).unwrap();
        let b = ranges.allocate(100, 1).unwrap();
        let c = ranges.allocate(100, 1).unwrap();
        ranges.free(a, 100);
        ranges.free(c, 100);
        assert_eq!(ranges.free.len(), 2);
        ranges.free(b, 100);
        assert_eq!(ranges.free, vec![0..300]);
        assert_eq!(ranges.allocate(300, 1), Some(0));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut ranges = RangeAllocator::new(300);
        let a = ranges.allocate(100, 1).unwrap();
        ranges.free(a, 100);
        ranges.free(a, 100);
    }
}
