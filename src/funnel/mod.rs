//! Two-track follow-up funnel: scheduling state, the message graph and the
//! components that act on them.

pub mod controller;
pub mod delivery;
pub mod dispatcher;
pub mod graph;
pub mod reclaimer;
pub mod record;
pub mod retry;

pub use controller::TrackController;
pub use delivery::{Courier, SendOutcome};
pub use dispatcher::{CycleReport, Dispatcher, spawn_dispatcher};
pub use graph::{FunnelGraph, FunnelStep};
pub use reclaimer::InactivityReclaimer;
pub use record::{EntryPoint, LastSend, ScheduleRecord, SendStatus, Track, TrackSlot};
pub use retry::{RetryDecision, RetryPolicy};
