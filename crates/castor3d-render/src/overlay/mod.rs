//! 2D overlay rendering: panels, bordered panels and text drawn over a
//! render target from batched vertex pools.

pub mod data;
pub mod pipeline;
pub mod pool;
pub mod preparer;
pub mod quad;
pub mod renderer;

pub use data::{
    BorderPosition, BorderSize, FontTexture, Glyph, MaterialPass, Overlay, OverlayId,
    OverlayKind, PassId, PassTexture, TextureFlags,
};
pub use pipeline::{PipelineCache, PipelineKey};
pub use pool::{OverlaySlot, OverlayUbo, OverlayVertexPools};
pub use preparer::{PrepareSummary, Preparer};
pub use quad::{BorderQuad, OverlayQuad, OverlayVertex, PanelQuad, TextQuad, TextVertex};
pub use renderer::{OverlayCameraUbo, OverlayRenderer, OverlayTarget};
