//! Background workers.

pub mod session_sweeper;

pub use session_sweeper::{SweepHandle, SweepWorker};
