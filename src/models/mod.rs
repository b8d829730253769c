pub mod session;

pub use session::{SleepSession, UNRATED};
