//! Byte counting for streams on their way to a provider, with throttled
//! progress reports.

use bytes::Bytes;
use futures::Stream;
use std::fmt::{Debug, Formatter};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Progress update information sent to callbacks
#[derive(Clone, Copy)]
pub struct ProgressUpdate {
    /// Total size in bytes
    pub total_size: u64,
    /// Bytes passed through so far
    pub transferred: u64,
    /// Progress (0.0 - 1.0)
    pub progress: f64,
    /// Average speed since the stream started
    pub speed_bytes_per_sec: u64,
}

impl ProgressUpdate {
    pub fn new(total_size: u64, transferred: u64, speed_bytes_per_sec: u64) -> Self {
        let progress = if total_size > 0 {
            (transferred as f64 / total_size as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self {
            total_size,
            transferred,
            progress,
            speed_bytes_per_sec,
        }
    }
}

impl Debug for ProgressUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Progress: {:.1}% ({} / {}) @ {}/s",
            self.progress * 100.0,
            format_bytes(self.transferred),
            format_bytes(self.total_size),
            format_bytes(self.speed_bytes_per_sec),
        )
    }
}

/// Format bytes into human-readable string (e.g., "10.5 MB")
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Trait for receiving progress updates
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

/// Closure-based progress callback
pub struct FnProgress<F>(pub F);

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        (self.0)(update)
    }
}

/// A stream wrapper that counts the bytes flowing through it and reports
/// every `report_every` bytes, plus once at the end.
pub struct ProgressStream<S> {
    inner: S,
    callback: Arc<dyn ProgressCallback>,
    total_size: u64,
    transferred: u64,
    last_reported: u64,
    report_every: u64,
    start_offset: u64,
    started: Instant,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total_size: u64, report_every: u64, callback: Arc<dyn ProgressCallback>) -> Self {
        Self {
            inner,
            callback,
            total_size,
            transferred: 0,
            last_reported: 0,
            report_every: report_every.max(1),
            start_offset: 0,
            started: Instant::now(),
        }
    }

    /// Start counting from bytes that were already sent elsewhere
    pub fn with_offset(mut self, already_transferred: u64) -> Self {
        self.transferred = already_transferred;
        self.last_reported = already_transferred;
        self.start_offset = already_transferred;
        self
    }

    fn report(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            ((self.transferred - self.start_offset) as f64 / elapsed) as u64
        } else {
            0
        };
        self.last_reported = self.transferred;
        self.callback
            .on_progress(ProgressUpdate::new(self.total_size, self.transferred, speed));
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.transferred += bytes.len() as u64;
                if self.transferred - self.last_reported >= self.report_every
                    || self.transferred == self.total_size
                {
                    self.report();
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                if self.transferred != self.last_reported {
                    self.report();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_reports_are_throttled() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Arc<dyn ProgressCallback> = Arc::new(FnProgress(move |u: ProgressUpdate| {
            sink.lock().unwrap().push(u.transferred);
        }));

        let chunks: Vec<io::Result<Bytes>> = (0..10).map(|_| Ok(Bytes::from_static(b"abc"))).collect();
        let stream = ProgressStream::new(futures::stream::iter(chunks), 30, 10, callback);
        let out: Vec<_> = stream.collect().await;

        assert_eq!(out.len(), 10);
        assert_eq!(*seen.lock().unwrap(), vec![12, 24, 30]);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(ProgressUpdate::new(10, 20, 0).progress, 1.0);
        assert_eq!(ProgressUpdate::new(0, 0, 0).progress, 1.0);
        assert!(format!("{:?}", ProgressUpdate::new(2048, 1024, 0)).contains("50.0%"));
    }
}
