//! Bounded-concurrency part uploads with aggregate progress.
//!
//! The driver never retries and never aborts the storage session. A failed
//! part is reported next to the parts that did succeed so the caller can
//! re-upload only what is missing.

use crate::models::session::PartToken;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::FuturesUnordered};
use std::{
    io::{self, SeekFrom},
    ops::Range,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::{Semaphore, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Aggregate progress of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("storage answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("response carried no etag")]
    MissingEtag,
    #[error("could not read part bytes: {0}")]
    Io(#[from] io::Error),
}

/// One part that did not make it, with the reason.
#[derive(Debug, Error)]
#[error("part {part_number}: {error}")]
pub struct PartFailure {
    pub part_number: u32,
    #[source]
    pub error: TransportError,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{} part(s) failed", .failed.len())]
    PartsFailed {
        completed: Vec<PartToken>,
        failed: Vec<PartFailure>,
    },
    #[error("upload cancelled")]
    Cancelled { completed: Vec<PartToken> },
}

/// Moves one part body to a pre-signed URL and returns the raw ETag.
#[async_trait]
pub trait PartTransport: Send + Sync {
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        progress: PartProgress,
    ) -> Result<String, TransportError>;
}

/// Where part bytes come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Bytes),
    /// Read lazily; at most `concurrency` parts are held in memory.
    File(PathBuf),
}

impl UploadSource {
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            UploadSource::Memory(bytes) => Ok(bytes.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    pub async fn slice(&self, range: Range<u64>) -> io::Result<Bytes> {
        match self {
            UploadSource::Memory(bytes) => {
                let start = usize::try_from(range.start).map_err(io::Error::other)?;
                let end = usize::try_from(range.end).map_err(io::Error::other)?;
                if start > end || end > bytes.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "range past end of source",
                    ));
                }
                Ok(bytes.slice(start..end))
            }
            UploadSource::File(path) => {
                let len = usize::try_from(range.end - range.start).map_err(io::Error::other)?;
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// A part waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartJob {
    pub part_number: u32,
    pub range: Range<u64>,
    pub url: String,
}

struct ProgressState {
    total_bytes: u64,
    part_count: usize,
    sent: Vec<AtomicU64>,
    completed: AtomicUsize,
    tx: watch::Sender<UploadProgress>,
}

/// Aggregates per-part byte counts into [`UploadProgress`] snapshots.
///
/// Each part slot only grows, so the aggregate is monotonic even when a part
/// is retried. Percent stays below 100 until every part has completed.
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<ProgressState>,
}

impl ProgressReporter {
    /// `part_sizes[i]` is the length of part `i + 1`.
    pub fn new(part_sizes: &[u64]) -> (Self, watch::Receiver<UploadProgress>) {
        let total_bytes = part_sizes.iter().sum();
        let (tx, rx) = watch::channel(UploadProgress {
            uploaded_bytes: 0,
            total_bytes,
            percent: 0,
        });
        let reporter = Self::with_sender(part_sizes, tx);
        (reporter, rx)
    }

    pub fn with_sender(part_sizes: &[u64], tx: watch::Sender<UploadProgress>) -> Self {
        let total_bytes = part_sizes.iter().sum();
        Self {
            state: Arc::new(ProgressState {
                total_bytes,
                part_count: part_sizes.len(),
                sent: part_sizes.iter().map(|_| AtomicU64::new(0)).collect(),
                completed: AtomicUsize::new(0),
                tx,
            }),
        }
    }

    pub fn snapshot(&self) -> UploadProgress {
        let state = &self.state;
        let uploaded_bytes = state
            .sent
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum::<u64>()
            .min(state.total_bytes);
        let all_done = state.completed.load(Ordering::Relaxed) >= state.part_count;
        let percent = if state.total_bytes == 0 {
            if all_done { 100 } else { 0 }
        } else {
            let raw = (u128::from(uploaded_bytes) * 100 / u128::from(state.total_bytes)) as u8;
            if all_done { raw } else { raw.min(99) }
        };
        UploadProgress {
            uploaded_bytes,
            total_bytes: state.total_bytes,
            percent,
        }
    }

    pub(crate) fn part(&self, part_number: u32, part_len: u64) -> PartProgress {
        PartProgress {
            reporter: self.clone(),
            index: (part_number as usize).saturating_sub(1),
            part_len,
            attempt: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record(&self, index: usize, bytes: u64) {
        if let Some(slot) = self.state.sent.get(index) {
            slot.fetch_max(bytes, Ordering::Relaxed);
            self.publish();
        }
    }

    pub(crate) fn finish(&self, index: usize, part_len: u64) {
        if let Some(slot) = self.state.sent.get(index) {
            slot.fetch_max(part_len, Ordering::Relaxed);
            self.state.completed.fetch_add(1, Ordering::Relaxed);
            self.publish();
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.state.tx.send_if_modified(|current| {
            if next.uploaded_bytes > current.uploaded_bytes || next.percent > current.percent {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

/// Progress handle for one in-flight part attempt.
#[derive(Clone)]
pub struct PartProgress {
    reporter: ProgressReporter,
    index: usize,
    part_len: u64,
    attempt: Arc<AtomicU64>,
}

impl PartProgress {
    /// Report `bytes` more bytes handed to the connection.
    pub fn add(&self, bytes: u64) {
        let sent = self.attempt.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.reporter.record(self.index, sent.min(self.part_len));
    }
}

enum PartOutcome {
    Done(PartToken),
    Failed(PartFailure),
    Cancelled,
}

/// Uploads parts with at most `concurrency` requests in flight.
#[derive(Debug, Clone, Copy)]
pub struct UploadDriver {
    concurrency: usize,
}

impl UploadDriver {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Upload every job. Tokens come back sorted by part number.
    ///
    /// Parts are admitted in job order. A failed part does not stop the
    /// others; cancelling stops only the parts that have not settled yet.
    pub async fn drive<T>(
        &self,
        source: &UploadSource,
        jobs: Vec<PartJob>,
        transport: &T,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<PartToken>, DriverError>
    where
        T: PartTransport + ?Sized,
    {
        let semaphore = Semaphore::new(self.concurrency);
        let mut in_flight = FuturesUnordered::new();
        for job in jobs {
            in_flight.push(run_part(&semaphore, source, job, transport, progress, cancel));
        }

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = false;
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                PartOutcome::Done(token) => completed.push(token),
                PartOutcome::Failed(failure) => {
                    warn!(part_number = failure.part_number, error = %failure.error, "part upload failed");
                    failed.push(failure);
                }
                PartOutcome::Cancelled => cancelled = true,
            }
        }

        completed.sort_by_key(|token| token.part_number);
        if cancelled {
            return Err(DriverError::Cancelled { completed });
        }
        if !failed.is_empty() {
            failed.sort_by_key(|failure| failure.part_number);
            return Err(DriverError::PartsFailed { completed, failed });
        }
        Ok(completed)
    }
}

async fn run_part<T>(
    semaphore: &Semaphore,
    source: &UploadSource,
    job: PartJob,
    transport: &T,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> PartOutcome
where
    T: PartTransport + ?Sized,
{
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return PartOutcome::Cancelled,
        permit = semaphore.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return PartOutcome::Cancelled,
        },
    };

    let part_number = job.part_number;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => PartOutcome::Cancelled,
        result = upload_part(source, job, transport, progress) => match result {
            Ok(token) => PartOutcome::Done(token),
            Err(error) => PartOutcome::Failed(PartFailure { part_number, error }),
        },
    }
}

async fn upload_part<T>(
    source: &UploadSource,
    job: PartJob,
    transport: &T,
    progress: &ProgressReporter,
) -> Result<PartToken, TransportError>
where
    T: PartTransport + ?Sized,
{
    let part_len = job.range.end - job.range.start;
    let body = source.slice(job.range).await?;
    let handle = progress.part(job.part_number, part_len);
    let etag = transport.put_part(&job.url, body, handle).await?;
    progress.finish((job.part_number as usize).saturating_sub(1), part_len);
    debug!(part_number = job.part_number, "part uploaded");
    Ok(PartToken::new(job.part_number, normalize_etag(&etag)))
}

/// Completion needs quoted ETags; some stores return them bare.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed.to_string()
    } else {
        format!("\"{}\"", trimmed.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Mutex, time::Duration};

    fn jobs(sizes: &[u64]) -> Vec<PartJob> {
        let mut start = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let job = PartJob {
                    part_number: i as u32 + 1,
                    range: start..start + size,
                    url: format!("mem://part/{}", i + 1),
                };
                start += size;
                job
            })
            .collect()
    }

    fn part_of(url: &str) -> u32 {
        url.rsplit('/').next().unwrap().parse().unwrap()
    }

    /// Counts concurrent calls and reports progress in two halves.
    #[derive(Default)]
    struct CountingTransport {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        fail: HashSet<u32>,
        hang: HashSet<u32>,
        started: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PartTransport for CountingTransport {
        async fn put_part(
            &self,
            url: &str,
            body: Bytes,
            progress: PartProgress,
        ) -> Result<String, TransportError> {
            let part = part_of(url);
            self.started.lock().unwrap().push(part);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            if self.hang.contains(&part) {
                std::future::pending::<()>().await;
            }
            let half = body.len() as u64 / 2;
            progress.add(half);
            tokio::time::sleep(Duration::from_millis(5)).await;
            progress.add(body.len() as u64 - half);

            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail.contains(&part) {
                return Err(TransportError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(format!("etag-{}", part))
        }
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let sizes = vec![10u64; 12];
        let source = UploadSource::Memory(Bytes::from(vec![7u8; 120]));
        let transport = CountingTransport::default();
        let (progress, _rx) = ProgressReporter::new(&sizes);

        let tokens = UploadDriver::new(3)
            .drive(
                &source,
                jobs(&sizes),
                &transport,
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(tokens.len(), 12);
        assert!(transport.max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(transport.max_seen.load(Ordering::SeqCst), 3);
        assert_eq!(*transport.started.lock().unwrap(), (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn tokens_are_sorted_and_quoted() {
        let sizes = vec![4, 4, 2];
        let source = UploadSource::Memory(Bytes::from_static(b"abcdefghij"));
        let (progress, _rx) = ProgressReporter::new(&sizes);

        let tokens = UploadDriver::new(8)
            .drive(
                &source,
                jobs(&sizes).into_iter().rev().collect(),
                &CountingTransport::default(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let numbers: Vec<u32> = tokens.iter().map(|t| t.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(tokens[0].e_tag, "\"etag-1\"");
    }

    #[tokio::test]
    async fn progress_reaches_100_only_when_all_parts_finish() {
        let sizes = vec![50, 50];
        let source = UploadSource::Memory(Bytes::from(vec![0u8; 100]));
        let (progress, rx) = ProgressReporter::new(&sizes);

        progress.part(1, 50).add(50);
        progress.part(2, 50).add(50);
        let sent_but_unconfirmed = *rx.borrow();
        assert_eq!(sent_but_unconfirmed.uploaded_bytes, 100);
        assert_eq!(sent_but_unconfirmed.percent, 99);

        UploadDriver::new(2)
            .drive(
                &source,
                jobs(&sizes),
                &CountingTransport::default(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let done = *rx.borrow();
        assert_eq!(done.uploaded_bytes, 100);
        assert_eq!(done.total_bytes, 100);
        assert_eq!(done.percent, 100);
    }

    #[test]
    fn percent_is_floored() {
        let (progress, _rx) = ProgressReporter::new(&[3]);
        progress.part(1, 3).add(2);
        assert_eq!(progress.snapshot().percent, 66);
    }

    #[tokio::test]
    async fn failures_keep_completed_parts() {
        let sizes = vec![5, 5, 5];
        let source = UploadSource::Memory(Bytes::from(vec![1u8; 15]));
        let transport = CountingTransport {
            fail: HashSet::from([2]),
            ..Default::default()
        };
        let (progress, _rx) = ProgressReporter::new(&sizes);

        let err = UploadDriver::new(2)
            .drive(
                &source,
                jobs(&sizes),
                &transport,
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            DriverError::PartsFailed { completed, failed } => {
                let done: Vec<u32> = completed.iter().map(|t| t.part_number).collect();
                assert_eq!(done, vec![1, 3]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].part_number, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_only_unsettled_parts() {
        let sizes = vec![5, 5, 5];
        let source = UploadSource::Memory(Bytes::from(vec![1u8; 15]));
        let transport = CountingTransport {
            hang: HashSet::from([3]),
            ..Default::default()
        };
        let (progress, _rx) = ProgressReporter::new(&sizes);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = UploadDriver::new(3)
            .drive(&source, jobs(&sizes), &transport, &progress, &cancel)
            .await
            .unwrap_err();

        match err {
            DriverError::Cancelled { completed } => {
                let done: Vec<u32> = completed.iter().map(|t| t.part_number).collect();
                assert_eq!(done, vec![1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn normalizes_etags() {
        assert_eq!(normalize_etag("abc"), "\"abc\"");
        assert_eq!(normalize_etag("\"abc\""), "\"abc\"");
        assert_eq!(normalize_etag(" abc-3 "), "\"abc-3\"");
    }

    #[tokio::test]
    async fn file_source_reads_exact_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let source = UploadSource::File(path);
        assert_eq!(source.len().await.unwrap(), 10);
        assert_eq!(&source.slice(3..7).await.unwrap()[..], b"3456");
        assert!(source.slice(8..12).await.is_err());
    }
}
