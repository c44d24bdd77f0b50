pub mod handles;
pub mod heap_allocator;
pub mod heap_buckets;
pub mod heap_region;
pub mod range_allocator;
pub mod resource_desc;
pub mod ring_buffer;
