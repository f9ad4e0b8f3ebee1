//! Placement groups and the per-core placement table.

mod peering;
mod placement_group;
mod table;

pub use peering::PeeringCtx;
pub use placement_group::{
    PastIntervals, PgCreateInfo, PgHistory, PgInfo, PgInterval, PgState, PgStats, PlacementGroup,
};
pub use table::{CreationRole, PgOutcome, PgWaiter, PlacementTable};
