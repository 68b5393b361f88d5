use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Info,
    Verbose,
    Warning,
}

/// Destination for user-facing progress messages.
pub trait ReportSink: Send + Sync {
    fn write(&self, level: ReportLevel, message: &str);

    /// Marks the start of a long-running blocking operation.
    fn begin_activity(&self, _label: &str) {}

    fn end_activity(&self) {}
}

/// Handle passed to every component that talks to the user.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ReportSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    pub fn buffered() -> (Self, BufferedReport) {
        let report = BufferedReport::default();
        (Self::new(Arc::new(report.clone())), report)
    }

    pub fn line(&self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Info, message.as_ref());
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Verbose, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Warning, message.as_ref());
    }

    pub fn activity(&self, label: &str) -> ActivityGuard {
        self.sink.begin_activity(label);
        ActivityGuard {
            sink: Arc::clone(&self.sink),
        }
    }

    fn emit(&self, level: ReportLevel, message: &str) {
        tracing::debug!(target: "workpack::report", ?level, "{message}");
        self.sink.write(level, message);
    }
}

#[must_use]
pub struct ActivityGuard {
    sink: Arc<dyn ReportSink>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.sink.end_activity();
    }
}

/// Collects messages in memory.
#[derive(Clone, Default)]
pub struct BufferedReport {
    lines: Arc<Mutex<Vec<(ReportLevel, String)>>>,
}

impl BufferedReport {
    pub fn lines(&self) -> Vec<(ReportLevel, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(_, line)| line.contains(needle))
    }
}

impl ReportSink for BufferedReport {
    fn write(&self, level: ReportLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}
