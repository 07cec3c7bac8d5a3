use tokio::sync::oneshot;

/// An admission-queue request. `notify` is closed exactly once, by the
/// consumer, when the request is popped off the queue - this signals the
/// producer that the request has reached the front and may proceed.
pub struct Request {
    pub req_id: String,
    pub user_id: String,
    pub model_name: String,
    /// Monotone float priority; lower sorts earlier.
    pub priority: f64,
    /// Monotone arrival sequence (nanoseconds since queue start, or any
    /// strictly increasing counter).
    pub arrival_time: i64,
    pub notify: oneshot::Sender<()>,
}

impl Request {
    pub fn new(
        req_id: impl Into<String>,
        user_id: impl Into<String>,
        model_name: impl Into<String>,
        priority: f64,
        arrival_time: i64,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                req_id: req_id.into(),
                user_id: user_id.into(),
                model_name: model_name.into(),
                priority,
                arrival_time,
                notify: tx,
            },
            rx,
        )
    }
}
