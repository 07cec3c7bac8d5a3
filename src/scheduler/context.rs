use std::collections::HashSet;

use parking_lot::Mutex;

use crate::core::hash::{hash_token_blocks, BlockHash};
use crate::core::tokenizer::ChatMessage;

/// Either shape a request's prompt can arrive in - a raw completion string,
/// or a chat transcript the tokenizer renders through the model's chat
/// template before splitting into blocks.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Text(String),
    Chat(Vec<ChatMessage>),
}

/// A pod as seen by the scheduling framework: the subset of `PodSnapshot`
/// fields the filter/score plugins actually read, detached from the
/// datastore's internal locking so plugins never need to know about it.
#[derive(Debug, Clone)]
pub struct CandidatePod {
    pub key: String,
    pub request_waiting_num: u64,
    pub request_running_num: u64,
    pub gpu_cache_usage: f64,
    pub tpot: f64,
    pub ttft: f64,
    pub models: HashSet<String>,
}

/// Carries everything the filter/score/post-hook pipeline needs for one
/// request: model, prompt, pre-computed block hashes (computed once,
/// reused by both the prefix-cache scorer and its post-hook), the
/// eventual decode/prefill selection, and basic request metadata.
pub struct SchedulingContext {
    pub model: String,
    pub prompt: PromptInput,
    pub user_id: String,
    pub request_id: String,
    block_hashes: Mutex<Option<Vec<BlockHash>>>,
    decode_pod: Mutex<Option<String>>,
    prefill_pod: Mutex<Option<String>>,
}

impl SchedulingContext {
    pub fn new(model: impl Into<String>, prompt: PromptInput, user_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt,
            user_id: user_id.into(),
            request_id: request_id.into(),
            block_hashes: Mutex::new(None),
            decode_pod: Mutex::new(None),
            prefill_pod: Mutex::new(None),
        }
    }

    /// Lazily tokenize-and-hash the prompt (given its already-tokenized
    /// form) once per request; every subsequent caller within the same
    /// pipeline run gets the cached result.
    pub fn block_hashes(&self, tokens: &[u32], block_size: usize, max_blocks: usize) -> Vec<BlockHash> {
        let mut cached = self.block_hashes.lock();
        if let Some(hashes) = cached.as_ref() {
            return hashes.clone();
        }
        let hashes = hash_token_blocks(tokens, block_size, max_blocks);
        *cached = Some(hashes.clone());
        hashes
    }

    pub fn set_decode_pod(&self, pod: String) {
        *self.decode_pod.lock() = Some(pod);
    }

    pub fn decode_pod(&self) -> Option<String> {
        self.decode_pod.lock().clone()
    }

    pub fn set_prefill_pod(&self, pod: String) {
        *self.prefill_pod.lock() = Some(pod);
    }

    pub fn prefill_pod(&self) -> Option<String> {
        self.prefill_pod.lock().clone()
    }
}

/// Final output of one scheduling pass, handed to post-hooks.
#[derive(Debug, Clone)]
pub struct ScheduleDecision {
    pub decode_pod: String,
    pub prefill_pod: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hashes_are_memoized() {
        let ctx = SchedulingContext::new("m1", PromptInput::Text("hi".into()), "u1", "r1");
        let tokens: Vec<u32> = (0..200).collect();
        let first = ctx.block_hashes(&tokens, 128, 128);
        let second = ctx.block_hashes(&[], 128, 128); // different input, ignored once cached
        assert_eq!(first, second);
    }

    #[test]
    fn decode_prefill_roundtrip() {
        let ctx = SchedulingContext::new("m1", PromptInput::Text("hi".into()), "u1", "r1");
        assert!(ctx.decode_pod().is_none());
        ctx.set_decode_pod("pod-a".to_string());
        assert_eq!(ctx.decode_pod(), Some("pod-a".to_string()));
    }
}
