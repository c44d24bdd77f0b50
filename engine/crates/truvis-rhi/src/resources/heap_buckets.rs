use crate::foundation::capabilities::PlatformClass;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

#[rustfmt::skip]
const DESKTOP_BUCKETS: [u64; 21] = [
    256, 512, KB, 2 * KB, 4 * KB, 8 * KB, 16 * KB, 32 * KB, 64 * KB,
    128 * KB, 256 * KB, 512 * KB, MB, 2 * MB, 4 * MB, 8 * MB, 16 * MB, 32 * MB,
    64 * MB, 128 * MB, 256 * MB,
];

/// 每个 bucket 新建 region 时的大小
#[rustfmt::skip]
const DESKTOP_BLOCKS: [u64; 21] = [
    MB, MB, MB, MB, MB, MB, MB, MB, MB,
    2 * MB, 4 * MB, 4 * MB, 8 * MB, 8 * MB, 16 * MB, 16 * MB, 32 * MB, 32 * MB,
    64 * MB, 128 * MB, 256 * MB,
];

#[rustfmt::skip]
const MOBILE_BUCKETS: [u64; 18] = [
    256, 512, KB, 2 * KB, 4 * KB, 8 * KB, 16 * KB, 32 * KB, 64 * KB,
    128 * KB, 256 * KB, 512 * KB, MB, 2 * MB, 4 * MB, 8 * MB, 16 * MB, 32 * MB,
];

#[rustfmt::skip]
const MOBILE_BLOCKS: [u64; 18] = [
    MB, MB, MB, MB, MB, MB, MB, MB, MB,
    2 * MB, 4 * MB, 4 * MB, 8 * MB, 8 * MB, 16 * MB, 16 * MB, 32 * MB, 32 * MB,
];

/// 升序的尺寸分桶表
///
/// 超过最大 bucket 的请求落在 exact-size bucket（下标为 `len()`），region 大小等于请求大小且不会被复用。
#[derive(Clone, Copy, Debug)]
pub struct BucketTable {
    sizes: &'static [u64],
    blocks: &'static [u64],
}

impl BucketTable {
    pub fn for_platform(platform: PlatformClass) -> Self {
        match platform {
            PlatformClass::Desktop => Self {
                sizes: &DESKTOP_BUCKETS,
                blocks: &DESKTOP_BLOCKS,
            },
            PlatformClass::Mobile => Self {
                sizes: &MOBILE_BUCKETS,
                blocks: &MOBILE_BLOCKS,
            },
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    #[inline]
    pub fn exact_bucket(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_exact(&self, bucket: usize) -> bool {
        bucket >= self.sizes.len()
    }

    /// 返回满足 `table[i-1] < size <= table[i]` 的 `i`
    #[inline]
    pub fn bucket_index(&self, size: u64) -> usize {
        self.sizes.partition_point(|&bucket| bucket < size)
    }

    #[inline]
    pub fn bucket_size(&self, bucket: usize) -> Option<u64> {
        self.sizes.get(bucket).copied()
    }

    /// 新 region 的大小，exact-size bucket 等于请求大小
    #[inline]
    pub fn block_size(&self, bucket: usize, request: u64) -> u64 {
        match self.blocks.get(bucket) {
            Some(&block) => block.max(request),
            None => request,
        }
    }

    pub fn sizes(&self) -> &'static [u64] {
        self.sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_sorted_and_blocks_cover_buckets() {
        for platform in [PlatformClass::Desktop, PlatformClass::Mobile] {
            let table = BucketTable::for_platform(platform);
            assert!(table.sizes.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(table.sizes.len(), table.blocks.len());
            assert!(table.sizes.iter().zip(table.blocks).all(|(s, b)| s <= b));
        }
        let desktop = BucketTable::for_platform(PlatformClass::Desktop);
        let mobile = BucketTable::for_platform(PlatformClass::Mobile);
        assert!(desktop.len() > mobile.len());
        assert_eq!(desktop.bucket_size(desktop.len() - 1), Some(256 * MB));
    }

    #[test]
    fn test_bucket_lookup_boundaries() {
        for platform in [PlatformClass::Desktop, PlatformClass::Mobile] {
            let table = BucketTable::for_platform(platform);
            let mut lo = 0u64;
            for (i, &hi) in table.sizes.iter().enumerate() {
                for size in [lo + 1, (lo + hi) / 2 + 1, hi - 1, hi] {
                    if size > lo && size <= hi {
                        assert_eq!(table.bucket_index(size), i, "size {size} in ({lo}, {hi}]");
                    }
                }
                lo = hi;
            }
            assert_eq!(table.bucket_index(0), 0);
            assert_eq!(table.bucket_index(lo + 1), table.exact_bucket());
            assert!(table.is_exact(table.bucket_index(u64::MAX)));
        }
    }

    #[test]
    fn test_block_size() {
        let table = BucketTable::for_platform(PlatformClass::Desktop);
        assert_eq!(table.block_size(table.bucket_index(100), 256), MB);
        let huge = 300 * MB + 5;
        assert_eq!(table.block_size(table.bucket_index(huge), huge), huge);
    }
}
