use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("all slots of the {0} pool are in use")]
    SlotExhausted(&'static str),

    #[error("handle does not resolve to a live {0}")]
    StaleHandle(&'static str),

    #[error("invalid render target combination: {0}")]
    InvalidRenderTargets(&'static str),

    #[error("operation is not allowed inside an active render pass")]
    InsideRenderPass,

    #[error("no render pass is active")]
    NoActiveRenderPass,

    #[error("render pass has no further subpasses")]
    SubpassOutOfRange,

    #[error("no pipeline is bound")]
    NoPipelineBound,

    #[error("no index buffer is bound")]
    NoIndexBuffer,

    #[error("{0} is not supported by the active driver")]
    Unsupported(&'static str),

    #[error("fence value {requested} can never signal (latest enqueued is {enqueued})")]
    FenceNeverSignaled { requested: u64, enqueued: u64 },

    #[error("presentable surface was lost and could not be recovered")]
    SurfaceLost,
}
