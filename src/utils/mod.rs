pub mod handle;
pub mod per_frame;

pub use handle::*;
pub use per_frame::*;
