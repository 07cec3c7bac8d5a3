pub mod schedule_request;

pub use schedule_request::{ChatMessageDto, PromptDto, ScheduleRequest, ScheduleResponse};
