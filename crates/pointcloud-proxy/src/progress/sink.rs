//! The narrow interface fetchers and converters report progress through.

use async_trait::async_trait;

/// Receives progress on the reporter's own 0 to 100 scale.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: f64, message: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _percent: f64, _message: &str) {}
}

/// Maps 0 to 100 onto `[start, end]` of an inner sink.
pub struct ScaledProgress<'a> {
    inner: &'a dyn ProgressSink,
    start: f64,
    end: f64,
}

impl<'a> ScaledProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, start: f64, end: f64) -> Self {
        Self { inner, start, end }
    }

    fn map(&self, percent: f64) -> f64 {
        let fraction = if percent.is_finite() {
            percent.clamp(0.0, 100.0) / 100.0
        } else {
            0.0
        };
        self.start + (self.end - self.start) * fraction
    }
}

#[async_trait]
impl ProgressSink for ScaledProgress<'_> {
    async fn report(&self, percent: f64, message: &str) {
        self.inner.report(self.map(percent), message).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every report.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) reports: Mutex<Vec<(f64, String)>>,
    }

    impl RecordingSink {
        pub(crate) fn percents(&self) -> Vec<f64> {
            self.reports.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, percent: f64, message: &str) {
            self.reports
                .lock()
                .unwrap()
                .push((percent, message.to_string()));
        }
    }

    #[tokio::test]
    async fn test_scaled_progress_maps_into_range() {
        let sink = RecordingSink::default();
        let scaled = ScaledProgress::new(&sink, 70.0, 100.0);
        scaled.report(0.0, "start").await;
        scaled.report(50.0, "half").await;
        scaled.report(250.0, "overshoot").await;
        scaled.report(f64::NAN, "garbage").await;

        assert_eq!(sink.percents(), vec![70.0, 85.0, 100.0, 70.0]);
    }
}
