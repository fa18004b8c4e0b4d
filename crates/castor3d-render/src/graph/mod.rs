//! Frame graphs: passes declared against resources, ordered by their
//! hazards and run as chained queue submissions.

mod builder;
mod resource;
mod runnable;

pub use builder::{FrameGraph, PassDesc};
pub use resource::{Hazard, PassId, ResourceDesc, ResourceId, ResourceKind};
pub use runnable::{
    EnabledCallback, EnabledFlag, RecordContext, RecordMode, RunnableGraph, RunnablePass,
};
