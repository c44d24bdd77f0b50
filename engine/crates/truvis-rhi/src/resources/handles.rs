use slotmap::new_key_type;

new_key_type! { pub struct BufferHandle; }
new_key_type! { pub struct TextureHandle; }
new_key_type! { pub struct RegionKey; }

/// region 中的资源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}
