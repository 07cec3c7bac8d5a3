pub mod priority_queue;
pub mod request;

pub use priority_queue::PriorityQueue;
pub use request::Request;
