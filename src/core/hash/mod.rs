pub mod block_hash;

pub use block_hash::{hash_block, hash_token_blocks, BlockHash};
