use bitflags::bitflags;

use crate::gpu::structs::{Buffer, Image};
use crate::utils::Handle;

#[cfg(feature = "kiln-serde")]
use serde::{Deserialize, Serialize};

/// Opaque identifier of a driver-side composite object (a bound vertex
/// layout, an attachment set). Only the owning driver can interpret it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeObject(pub u64);

/// Identity of one native context. Composite objects are bound to the
/// context that created them, so caches are keyed by this value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(pub u64);

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageBits: u32 {
        const SAMPLED       = 0x1;
        const RT_WRITE      = 0x2;
        const DEPTH_READ    = 0x4;
        const DEPTH_WRITE   = 0x8;
        const UAV_READ      = 0x10;
        const UAV_WRITE     = 0x20;
        const UNIFORM_READ  = 0x40;
        const STORAGE_READ  = 0x80;
        const STORAGE_WRITE = 0x100;
        const VERTEX_READ   = 0x200;
        const INDEX_READ    = 0x400;
        const INDIRECT_READ = 0x800;
        const COPY_SRC      = 0x1000;
        const COPY_DST      = 0x2000;
        const PRESENT       = 0x4000;
    }
}

bitflags! {
    /// Memory-hazard classes a driver barrier can cover. Writes record the
    /// classes that must be waited on before the written data is read again.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierBits: u32 {
        const TEXTURE_FETCH = 0x1;
        const SHADER_IMAGE  = 0x2;
        const UNIFORM       = 0x4;
        const STORAGE       = 0x8;
        const VERTEX_ATTRIB = 0x10;
        const INDEX         = 0x20;
        const INDIRECT      = 0x40;
        const FRAMEBUFFER   = 0x80;

        const ALL_IMAGE_READS = Self::TEXTURE_FETCH.bits()
            | Self::SHADER_IMAGE.bits()
            | Self::FRAMEBUFFER.bits();
        const ALL_BUFFER_READS = Self::UNIFORM.bits()
            | Self::STORAGE.bits()
            | Self::VERTEX_ATTRIB.bits()
            | Self::INDEX.bits()
            | Self::INDIRECT.bits();
    }
}

pub const USAGE_TO_BARRIER: &[(UsageBits, BarrierBits)] = &[
    (UsageBits::SAMPLED, BarrierBits::TEXTURE_FETCH),
    (UsageBits::UAV_READ, BarrierBits::SHADER_IMAGE),
    (UsageBits::UNIFORM_READ, BarrierBits::UNIFORM),
    (UsageBits::STORAGE_READ, BarrierBits::STORAGE),
    (UsageBits::VERTEX_READ, BarrierBits::VERTEX_ATTRIB),
    (UsageBits::INDEX_READ, BarrierBits::INDEX),
    (UsageBits::INDIRECT_READ, BarrierBits::INDIRECT),
    (UsageBits::RT_WRITE, BarrierBits::FRAMEBUFFER),
    (UsageBits::DEPTH_READ, BarrierBits::FRAMEBUFFER),
    (UsageBits::DEPTH_WRITE, BarrierBits::FRAMEBUFFER),
];

/// Barrier classes that must be satisfied before reading with `usage`.
pub fn read_barriers(usage: UsageBits) -> BarrierBits {
    let mut out = BarrierBits::empty();
    for (u, b) in USAGE_TO_BARRIER {
        if usage.intersects(*u) {
            out |= *b;
        }
    }
    out
}

/// Barrier classes a write with `usage` leaves pending on the resource.
pub fn write_barriers(usage: UsageBits) -> BarrierBits {
    let mut out = BarrierBits::empty();
    if usage.intersects(UsageBits::UAV_WRITE | UsageBits::RT_WRITE | UsageBits::DEPTH_WRITE) {
        out |= BarrierBits::ALL_IMAGE_READS;
    }
    if usage.intersects(UsageBits::STORAGE_WRITE) {
        out |= BarrierBits::ALL_BUFFER_READS;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn byte_size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// Logical primitive topology as declared by a pipeline. Patch lists carry
/// their control-point count, which is routed to the driver separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    PatchList(u32),
}

/// Topology actually handed to draw ops after patch-list resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    Patches,
}

/// Identity of a resource for hazard tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(Handle<Buffer>),
    Image(Handle<Image>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_barriers_cover_each_usage() {
        assert_eq!(
            read_barriers(UsageBits::SAMPLED),
            BarrierBits::TEXTURE_FETCH
        );
        assert_eq!(
            read_barriers(UsageBits::UNIFORM_READ | UsageBits::INDIRECT_READ),
            BarrierBits::UNIFORM | BarrierBits::INDIRECT
        );
    }

    #[test]
    fn write_barriers_split_image_and_buffer_classes() {
        assert_eq!(
            write_barriers(UsageBits::UAV_WRITE),
            BarrierBits::ALL_IMAGE_READS
        );
        assert_eq!(
            write_barriers(UsageBits::STORAGE_WRITE),
            BarrierBits::ALL_BUFFER_READS
        );
        assert!(write_barriers(UsageBits::SAMPLED).is_empty());
    }
}
