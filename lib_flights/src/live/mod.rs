//! # Live Queries
//!
//! Everything that runs for the lifetime of one client session: the search
//! parameters it sends, the scheduler that polls on its behalf, and the
//! coordinator that ties the three session activities together and reports how
//! the session ended.

mod params;
mod scheduler;
mod session;
mod termination;

pub use params::{ClientIdentity, SearchParameters};
pub use scheduler::{LiveQueryScheduler, SchedulerSettings};
pub use session::{
    FlightOutbound, InboundError, OutboundError, ParameterInbound, SessionCoordinator, SessionSettings,
};
pub use termination::{SessionOutcome, TerminationSignal};
