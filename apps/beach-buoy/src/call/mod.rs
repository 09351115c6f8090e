pub mod manager;
pub mod session;
pub mod watchdog;

pub use manager::{CallManager, CallSettings, DuplicateOfferPolicy, ExitHandle, SessionLimit};
pub use session::{CallSession, CallState, EndReason, SessionConfig};
pub use watchdog::Watchdog;
