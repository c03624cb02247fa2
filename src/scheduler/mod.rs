//! Leader-side placement of allocations.

pub mod dispatch;
pub mod placement;
pub mod planner;
pub mod restart;
pub mod update;

pub use dispatch::{dispatch, dispatch_id};
pub use placement::{select_node, Reservations};
pub use planner::{plan, Planner};
pub use restart::{RestartDecision, RestartTracker};
