pub mod token_tracker;

pub use token_tracker::{TokenTracker, NO_TRACKED_TOKENS};
