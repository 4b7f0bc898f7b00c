use bytemuck::{Pod, Zeroable};

use super::driver::types::{Topology, UsageBits};
use crate::utils::Handle;

#[cfg(feature = "kiln-serde")]
use serde::{Deserialize, Serialize};

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VERTEX_STREAMS: usize = 8;
pub const MAX_VIEWPORTS: usize = 8;

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum Format {
    R8Sint,
    R8Uint,
    BGRA8,
    BGRA8Unorm,
    #[default]
    RGBA8,
    RGBA8Unorm,
    RGBA16F,
    RGBA32F,
    D24S8,
    D32F,
}

impl Format {
    pub fn has_depth(self) -> bool {
        matches!(self, Format::D24S8 | Format::D32F)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24S8)
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum SampleCount {
    #[default]
    S1,
    S2,
    S4,
    S8,
}

impl SampleCount {
    pub fn count(self) -> u32 {
        match self {
            SampleCount::S1 => 1,
            SampleCount::S2 => 2,
            SampleCount::S4 => 4,
            SampleCount::S8 => 8,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum MemoryVisibility {
    Gpu,
    CpuAndGpu,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum BufferUsage {
    All,
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
}

#[derive(Debug, Hash, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

#[derive(Debug, Hash, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Rect2D {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct FRect2D {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub area: FRect2D,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            area: Default::default(),
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

// --- Rasterizer / blend / depth-stencil descriptions --------------------------

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct RasterDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clamp: bool,
    pub scissor_enable: bool,
}

impl Default for RasterDesc {
    fn default() -> Self {
        Self {
            fill_mode: Default::default(),
            cull_mode: Default::default(),
            front_counter_clockwise: false,
            depth_bias: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clamp: false,
            scissor_enable: false,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum BlendFactor {
    #[default]
    One,
    Zero,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
    ConstantFactor,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    InvSubtract,
    Min,
    Max,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct BlendTargetDesc {
    pub blend_enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl Default for BlendTargetDesc {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct BlendDesc {
    pub targets: [BlendTargetDesc; MAX_RENDER_TARGETS],
    pub sample_mask: u32,
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self {
            targets: Default::default(),
            sample_mask: !0,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct StencilFaceDesc {
    pub func: CompareOp,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: CompareOp,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: StencilFaceDesc,
    pub back_face: StencilFaceDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write_enable: true,
            depth_func: CompareOp::Less,
            stencil_enable: false,
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
            front_face: Default::default(),
            back_face: Default::default(),
        }
    }
}

// --- Vertex layout ------------------------------------------------------------

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum VertexFormat {
    Float,
    Vec2,
    Vec3,
    Vec4,
    UVec4,
    IVec4,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum VertexRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct VertexEntry {
    pub format: VertexFormat,
    pub location: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct VertexStreamLayout {
    pub stride: u32,
    pub rate: VertexRate,
    pub entries: Vec<VertexEntry>,
}

// --- Resources and views ------------------------------------------------------

#[derive(Hash, Clone, Debug, Default, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum AspectMask {
    #[default]
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

#[derive(Debug)]
pub struct Image {
    pub dim: [u32; 3],
    pub layers: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub samples: SampleCount,
    pub debug_name: String,
}

pub struct ImageInfo<'a> {
    pub debug_name: &'a str,
    pub dim: [u32; 3],
    pub layers: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub samples: SampleCount,
}

impl<'a> Default for ImageInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            dim: [1280, 1024, 1],
            layers: 1,
            format: Format::RGBA8,
            mip_levels: 1,
            samples: SampleCount::S1,
        }
    }
}

/// A lightweight view over one subresource of an image. Views are plain
/// values; two views with identical fields denote the same subresource.
#[derive(Hash, Clone, Debug, Default, Copy, PartialEq, Eq)]
pub struct ImageView {
    pub img: Handle<Image>,
    pub mip_level: u32,
    pub layer: u32,
    pub aspect: AspectMask,
}

pub struct ImageViewInfo<'a> {
    pub debug_name: &'a str,
    pub img: Handle<Image>,
    pub mip_level: u32,
    pub layer: u32,
    pub aspect: AspectMask,
}

impl<'a> Default for ImageViewInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            img: Default::default(),
            mip_level: 0,
            layer: 0,
            aspect: Default::default(),
        }
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub byte_size: u32,
    pub usage: BufferUsage,
    pub visibility: MemoryVisibility,
    pub debug_name: String,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferInfo<'a> {
    pub debug_name: &'a str,
    pub byte_size: u32,
    pub usage: BufferUsage,
    pub visibility: MemoryVisibility,
}

impl<'a> Default for BufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            byte_size: 1024,
            usage: BufferUsage::Uniform,
            visibility: MemoryVisibility::CpuAndGpu,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub struct SamplerInfo {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct Sampler {
    pub info: SamplerInfo,
    pub debug_name: String,
}

pub struct Fence {
    pub debug_name: String,
}

#[derive(Debug)]
pub struct Semaphore {
    pub debug_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum QueryKind {
    Occlusion,
    Timestamp,
    PipelineStatistics,
}

#[derive(Debug)]
pub struct Query {
    pub kind: QueryKind,
    pub debug_name: String,
    pub(crate) active: bool,
}

pub struct QueryInfo<'a> {
    pub debug_name: &'a str,
    pub kind: QueryKind,
}

impl<'a> Default for QueryInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            kind: QueryKind::Occlusion,
        }
    }
}

// --- Pipelines ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub color_target_count: u32,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub vertex_streams: Vec<VertexStreamLayout>,
    pub topology: Topology,
    pub raster: RasterDesc,
    pub blend: BlendDesc,
    pub depth_stencil: DepthStencilDesc,
    /// One bit per color target; cleared bits mask all writes to the target.
    pub rt_write_mask: u32,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            color_target_count: 1,
            color_formats: vec![Format::RGBA8],
            depth_format: None,
            vertex_streams: Vec::new(),
            topology: Topology::TriangleList,
            raster: Default::default(),
            blend: Default::default(),
            depth_stencil: Default::default(),
            rt_write_mask: !0,
        }
    }
}

#[derive(Debug)]
pub struct GraphicsPipeline {
    pub desc: GraphicsPipelineDesc,
    pub debug_name: String,
}

pub struct GraphicsPipelineInfo<'a> {
    pub debug_name: &'a str,
    pub desc: GraphicsPipelineDesc,
}

impl<'a> Default for GraphicsPipelineInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            desc: Default::default(),
        }
    }
}

#[derive(Debug)]
pub struct ComputePipeline {
    pub debug_name: String,
}

pub struct ComputePipelineInfo<'a> {
    pub debug_name: &'a str,
}

impl<'a> Default for ComputePipelineInfo<'a> {
    fn default() -> Self {
        Self { debug_name: "" }
    }
}

// --- Bindings -----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "kiln-serde", derive(Serialize, Deserialize))]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShaderResource {
    UniformBuffer {
        buffer: Handle<Buffer>,
        offset: u64,
        size: u64,
    },
    /// Uniform buffer whose offset is expected to move frequently (ring
    /// allocation); offset moves rebind through the cheap dynamic path.
    DynamicUniformBuffer {
        buffer: Handle<Buffer>,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: Handle<Buffer>,
        offset: u64,
        size: u64,
        access: Access,
    },
    SampledImage {
        view: ImageView,
        sampler: Handle<Sampler>,
    },
    StorageImage {
        view: ImageView,
        access: Access,
    },
}

impl ShaderResource {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ShaderResource::DynamicUniformBuffer { .. })
    }

    pub fn read_usage(&self) -> UsageBits {
        match self {
            ShaderResource::UniformBuffer { .. } | ShaderResource::DynamicUniformBuffer { .. } => {
                UsageBits::UNIFORM_READ
            }
            ShaderResource::StorageBuffer { access, .. } => {
                if matches!(access, Access::Write) {
                    UsageBits::empty()
                } else {
                    UsageBits::STORAGE_READ
                }
            }
            ShaderResource::SampledImage { .. } => UsageBits::SAMPLED,
            ShaderResource::StorageImage { access, .. } => {
                if matches!(access, Access::Write) {
                    UsageBits::empty()
                } else {
                    UsageBits::UAV_READ
                }
            }
        }
    }

    pub fn write_usage(&self) -> UsageBits {
        match self {
            ShaderResource::StorageBuffer { access, .. } if access.writes() => {
                UsageBits::STORAGE_WRITE
            }
            ShaderResource::StorageImage { access, .. } if access.writes() => UsageBits::UAV_WRITE,
            _ => UsageBits::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedResource {
    pub slot: u32,
    pub resource: ShaderResource,
}

pub struct BindGroup {
    pub(crate) bindings: Vec<IndexedResource>,
    pub debug_name: String,
}

impl BindGroup {
    pub fn bindings(&self) -> &[IndexedResource] {
        &self.bindings
    }

    pub fn has_dynamic_resources(&self) -> bool {
        self.bindings.iter().any(|b| b.resource.is_dynamic())
    }
}

pub struct BindGroupInfo<'a> {
    pub debug_name: &'a str,
    pub bindings: &'a [IndexedResource],
}

impl<'a> Default for BindGroupInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            bindings: &[],
        }
    }
}

// --- Render targets -----------------------------------------------------------

/// A color or depth-stencil target binding. `Surface` is the implicit
/// default target backed by the presentation engine; it can only be
/// combined with the matching default counterpart.
#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    Surface,
    View(ImageView),
}

// --- Indirect arguments -------------------------------------------------------

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
pub struct DispatchIndirectCommand {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}
