pub mod engine_adapter;
pub mod store;
pub mod types;

pub use engine_adapter::{EngineAdapter, PodGauges, VllmEngineAdapter};
pub use store::{CallbackFn, Datastore, PodSnapshot};
pub use types::{
    key_str, CallbackKind, Key, ModelMatch, ModelRoute, ModelServer, PdGroupPods, PdGroupSpec,
    PodMetrics, PodRecord, ResourceEvent, RouteRule, StringMatch, TargetModel,
};
