//! Upload body wrapper that reports how much of a file has been sent.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::time::{Duration, Instant};

use super::progress::percent;

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        percent(self.sent, self.total)
    }
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Counts the bytes of a body stream of known length.
///
/// The callback fires at most once per `interval` while data flows and once
/// more when the stream ends.
pub struct ProgressStream<S> {
    inner: S,
    progress: UploadProgress,
    interval: Duration,
    last_report: Instant,
    finished: bool,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, total: u64, interval: Duration, callback: ProgressCallback) -> Self {
        Self {
            inner,
            progress: UploadProgress { sent: 0, total },
            interval,
            last_report: Instant::now(),
            finished: false,
            callback,
        }
    }

    pub fn sent(&self) -> u64 {
        self.progress.sent
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = ready!(Pin::new(&mut self.inner).poll_next(cx));

        match &next {
            Some(Ok(chunk)) => {
                self.progress.sent += chunk.len() as u64;
                if self.last_report.elapsed() >= self.interval {
                    self.last_report = Instant::now();
                    (self.callback)(self.progress);
                }
            }
            Some(Err(_)) => {}
            None if !self.finished => {
                self.finished = true;
                (self.callback)(self.progress);
            }
            None => {}
        }

        Poll::Ready(next)
    }
}
