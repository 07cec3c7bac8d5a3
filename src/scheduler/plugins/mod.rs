pub mod gpu_cache;
pub mod least_latency;
pub mod least_request;
pub mod lora_affinity;
pub mod prefix_cache;
pub mod random;
pub mod vtc_fair_router;

pub use gpu_cache::GpuCachePlugin;
pub use least_latency::LeastLatencyPlugin;
pub use least_request::LeastRequestPlugin;
pub use lora_affinity::LoraAffinityPlugin;
pub use prefix_cache::PrefixCachePlugin;
pub use random::RandomPlugin;
pub use vtc_fair_router::VtcFairRouterPlugin;
