pub mod controller;
pub mod state;

pub use controller::{SessionTracker, TrackerEvent, TrackerSnapshot};
pub use state::{Controls, TrackerState, TrackerStatus};
