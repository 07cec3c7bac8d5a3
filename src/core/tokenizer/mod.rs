pub mod client;
pub mod pool;

pub use client::{ChatMessage, TokenizeInput, TokenizerClient};
pub use pool::TokenizerPool;
