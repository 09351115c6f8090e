pub mod call;
pub mod candidate;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod engine;
pub mod media;
pub mod protocol;
pub mod runner;
pub mod telemetry;
pub mod transport;

pub use call::{CallManager, CallSettings, CallState, DuplicateOfferPolicy, EndReason, SessionLimit};
pub use config::BuoyConfig;
pub use dispatcher::SignalingDispatcher;
pub use runner::Buoy;
