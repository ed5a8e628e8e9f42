use tracing::{error, warn};

/// Operator notices: (title, message) pairs. Fatal errors are flushed
/// through the sink before the supervisor terminates the process.
pub trait MessageSink: Send + Sync {
    fn notify(&self, title: &str, message: &str);

    fn fatal(&self, title: &str, message: &str) {
        self.notify(title, message);
    }
}

/// Default sink: route notices through tracing.
pub struct LogSink;

impl MessageSink for LogSink {
    fn notify(&self, title: &str, message: &str) {
        warn!("{}: {}", title, message);
    }

    fn fatal(&self, title: &str, message: &str) {
        error!("{}: {}", title, message);
    }
}

/// Test sink that records every notice.
pub struct CollectingSink {
    notices: parking_lot::Mutex<Vec<(String, String)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        CollectingSink {
            notices: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn notices(&self) -> Vec<(String, String)> {
        self.notices.lock().clone()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSink for CollectingSink {
    fn notify(&self, title: &str, message: &str) {
        self.notices
            .lock()
            .push((title.to_string(), message.to_string()));
    }
}
