//! Duration logging for tool calls and protocol requests.
//!
//! A [`TimingGuard`] logs exactly once, when it is dropped. Tool calls and
//! wire requests have separate slow thresholds.
//!
//! ```rust,ignore
//! let _timing = TimingGuard::request(methods::TOOLS_LIST);
//! let tools = client.list_tools().await?;
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timed {
    Tool,
    Request,
}

impl Timed {
    fn as_str(self) -> &'static str {
        match self {
            Timed::Tool => "tool",
            Timed::Request => "request",
        }
    }

    /// `(slow, very_slow)`: logged at info and warn respectively.
    fn thresholds(self) -> (Duration, Duration) {
        match self {
            Timed::Tool => (Duration::from_millis(500), Duration::from_secs(10)),
            Timed::Request => (Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

pub struct TimingGuard {
    kind: Timed,
    name: String,
    started: Instant,
    slow: Duration,
    very_slow: Duration,
}

impl TimingGuard {
    /// Time one tool execution.
    pub fn tool(name: impl Into<String>) -> Self {
        Self::start(Timed::Tool, name.into())
    }

    /// Time one outbound request, keyed by method.
    pub fn request(method: impl Into<String>) -> Self {
        Self::start(Timed::Request, method.into())
    }

    fn start(kind: Timed, name: String) -> Self {
        trace!(kind = kind.as_str(), operation = %name, "Timing started");
        let (slow, very_slow) = kind.thresholds();
        Self {
            kind,
            name,
            started: Instant::now(),
            slow,
            very_slow,
        }
    }

    /// Override the info and warn thresholds.
    pub fn with_thresholds(mut self, slow: Duration, very_slow: Duration) -> Self {
        self.slow = slow;
        self.very_slow = very_slow.max(slow);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Render a duration as `850ms`, `2.41s` or `3m 12.0s`.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    match ms {
        0..=999 => format!("{ms}ms"),
        1000..=59_999 => format!("{:.2}s", duration.as_secs_f64()),
        _ => format!("{}m {:.1}s", ms / 60_000, (ms % 60_000) as f64 / 1000.0),
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let duration = format_duration(elapsed);
        let kind = self.kind.as_str();
        let operation = self.name.as_str();

        if elapsed >= self.very_slow {
            warn!(kind, operation, duration_ms, %duration, "Very slow {kind} finished");
        } else if elapsed >= self.slow {
            info!(kind, operation, duration_ms, %duration, "Slow {kind} finished");
        } else {
            debug!(kind, operation, duration_ms, %duration, "Finished {kind}");
        }
    }
}
