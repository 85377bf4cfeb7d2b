//! Streaming progress for long-running jobs.
//!
//! One emitter task per stream owns the channel sender and multiplexes the
//! job future, the heartbeat tick, the one-shot guidance deadline and the
//! lifetime bound. Chunks are therefore totally ordered:
//!
//! ```text
//! Started, (Heartbeat | Notice)*, (Asset* Final | Failed), Done
//! ```
//!
//! If the consumer goes away the job is not cancelled; it runs to completion
//! or to the lifetime bound and its outcome is logged. A consumer that stays
//! connected but stops reading loses filler chunks and cannot hold the job
//! back.

pub mod sse;

use std::future::Future;

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};

use crate::config::StreamConfig;
use crate::error::{JimengError, Result};
use crate::job::{asset_markdown, GenerationResult, JobKind};

pub use sse::{encode, event_stream, StreamHeader, DONE_EVENT};

/// Upstream page where users can find their creations.
pub const HISTORY_PAGE: &str = "https://jimeng.jianying.com/ai-tool/video/generate";

/// How long content chunks may wait for room once the lifetime bound has passed.
pub const FLUSH_GRACE: Duration = Duration::from_secs(30);

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// First chunk of every stream
    Started(String),
    /// Keep-alive filler
    Heartbeat,
    /// Guidance after the deadline; the stream stays open
    Notice(String),
    /// One result asset as markdown
    Asset {
        /// Position among the assets
        index: usize,
        /// Markdown line
        markdown: String,
    },
    /// Success summary, carries the stop reason
    Final(String),
    /// Readable failure, carries the stop reason
    Failed(String),
    /// End of stream marker
    Done,
}

impl StreamChunk {
    /// Text delivered to the client.
    pub fn content(&self) -> &str {
        match self {
            StreamChunk::Started(text)
            | StreamChunk::Notice(text)
            | StreamChunk::Final(text)
            | StreamChunk::Failed(text) => text,
            StreamChunk::Asset { markdown, .. } => markdown,
            StreamChunk::Heartbeat => ".",
            StreamChunk::Done => "",
        }
    }

    /// `finish_reason` of the chunk.
    pub fn finish_reason(&self) -> Option<&'static str> {
        match self {
            StreamChunk::Final(_) | StreamChunk::Failed(_) => Some("stop"),
            _ => None,
        }
    }

    /// Whether this is the terminal marker.
    pub fn is_done(&self) -> bool {
        matches!(self, StreamChunk::Done)
    }
}

fn started_text(kind: JobKind) -> String {
    match kind {
        JobKind::Video => "🎬 Video generation started, this usually takes a few minutes...".to_string(),
        _ => "🎨 Image generation started, please wait...".to_string(),
    }
}

fn notice_text(kind: JobKind, waited_secs: u64) -> String {
    format!(
        "\n\nThe {} is taking longer than {waited_secs}s but may still be generating. \
         You can keep waiting here or check your history at {HISTORY_PAGE}\n\n",
        kind.noun()
    )
}

fn final_text(kind: JobKind) -> String {
    format!("\n\n✅ {} generation complete!", capitalize(kind.noun()))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Caller-facing text for a failed job.
pub fn failure_text(kind: JobKind, err: &JimengError) -> String {
    let mut text = format!("\n\n⚠️ {} generation failed: {err}", capitalize(kind.noun()));
    if matches!(err, JimengError::TimedOut { .. } | JimengError::RecordMissing { .. }) {
        text.push_str(&format!(
            "\n\nThe job may still finish upstream. Check your history at {HISTORY_PAGE}"
        ));
    }
    if let Some(id) = err.correlation_id() {
        text.push_str(&format!("\n\nRecord id: {id}"));
    }
    text
}

/// Writes chunks until the consumer disappears or stops reading.
///
/// Filler (heartbeats, notices) never waits for room. Content waits, but not
/// past the lifetime bound plus [`FLUSH_GRACE`], so a stalled consumer cannot
/// pin the task.
struct Sink {
    tx: mpsc::Sender<StreamChunk>,
    open: bool,
    until: Instant,
}

impl Sink {
    fn close(&mut self, reason: &str) {
        self.open = false;
        tracing::info!(reason, "stream consumer gone, job continues in background");
    }

    fn offer(&mut self, chunk: StreamChunk) {
        if !self.open {
            return;
        }
        match self.tx.try_send(chunk) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => tracing::debug!("consumer behind, filler chunk dropped"),
            Err(TrySendError::Closed(_)) => self.close("disconnected"),
        }
    }

    async fn send(&mut self, chunk: StreamChunk) {
        if !self.open {
            return;
        }
        let give_up = self.until.max(Instant::now() + FLUSH_GRACE);
        match timeout_at(give_up, self.tx.send(chunk)).await {
            Ok(Ok(())) => {},
            Ok(Err(_)) => self.close("disconnected"),
            Err(_) => self.close("not reading"),
        }
    }
}

/// Start an emitter task driving `job` and return the chunk receiver.
pub fn spawn_emitter<F>(config: &StreamConfig, kind: JobKind, job: F) -> mpsc::Receiver<StreamChunk>
where
    F: Future<Output = Result<GenerationResult>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let sink = Sink {
        tx,
        open: true,
        until: Instant::now() + config.max_lifetime(),
    };
    tokio::spawn(emit(sink, config.clone(), kind, job));
    rx
}

async fn emit<F>(mut sink: Sink, config: StreamConfig, kind: JobKind, job: F)
where
    F: Future<Output = Result<GenerationResult>>,
{
    sink.send(StreamChunk::Started(started_text(kind))).await;

    let start = Instant::now();
    let mut heartbeat = interval_at(start + config.heartbeat(), config.heartbeat());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = sleep(config.deadline());
    let lifetime = sleep_until(sink.until);
    tokio::pin!(job, deadline, lifetime);
    let mut deadline_passed = false;

    let outcome = loop {
        tokio::select! {
            biased;
            result = &mut job => break Some(result),
            () = &mut lifetime => break None,
            () = &mut deadline, if !deadline_passed => {
                deadline_passed = true;
                tracing::info!(kind = %kind, "stream deadline passed, job still running");
                sink.offer(StreamChunk::Notice(notice_text(kind, config.deadline().as_secs())));
            },
            _ = heartbeat.tick() => sink.offer(StreamChunk::Heartbeat),
        }
    };

    match outcome {
        Some(Ok(result)) => {
            tracing::info!(
                correlation_id = %result.correlation_id,
                assets = result.assets.len(),
                delivered = sink.open,
                "stream job finished"
            );
            for (index, url) in result.assets.iter().enumerate() {
                sink.send(StreamChunk::Asset {
                    index,
                    markdown: asset_markdown(kind, index, url),
                })
                .await;
            }
            sink.send(StreamChunk::Final(final_text(kind))).await;
        },
        Some(Err(err)) => {
            tracing::warn!(
                correlation_id = err.correlation_id().unwrap_or("-"),
                error = %err,
                delivered = sink.open,
                "stream job failed"
            );
            sink.send(StreamChunk::Failed(failure_text(kind, &err))).await;
        },
        None => {
            tracing::warn!(
                lifetime_secs = config.max_lifetime_secs,
                delivered = sink.open,
                "stream lifetime exceeded, abandoning job"
            );
            let text = format!(
                "\n\n⚠️ Stopped waiting after {}s. Check your history at {HISTORY_PAGE}",
                config.max_lifetime_secs
            );
            sink.send(StreamChunk::Failed(text)).await;
        },
    }
    sink.send(StreamChunk::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(deadline_ms: u64, max_lifetime_secs: u64) -> StreamConfig {
        StreamConfig {
            heartbeat_ms: 5_000,
            deadline_ms,
            max_lifetime_secs,
            channel_capacity: 16,
        }
    }

    fn result(assets: &[&str]) -> GenerationResult {
        GenerationResult {
            correlation_id: "h1".into(),
            kind: JobKind::Image,
            assets: assets.iter().map(|s| s.to_string()).collect(),
            fail_code: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    fn shape(chunks: &[StreamChunk]) -> Vec<&'static str> {
        chunks
            .iter()
            .map(|c| match c {
                StreamChunk::Started(_) => "started",
                StreamChunk::Heartbeat => "heartbeat",
                StreamChunk::Notice(_) => "notice",
                StreamChunk::Asset { .. } => "asset",
                StreamChunk::Final(_) => "final",
                StreamChunk::Failed(_) => "failed",
                StreamChunk::Done => "done",
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_with_heartbeats() {
        let job = async {
            sleep(Duration::from_secs(12)).await;
            Ok(result(&["https://p/a.webp", "https://p/b.webp"]))
        };
        let chunks = collect(spawn_emitter(&config(120_000, 1500), JobKind::Image, job)).await;

        assert_eq!(
            shape(&chunks),
            ["started", "heartbeat", "heartbeat", "asset", "asset", "final", "done"]
        );
        assert_eq!(chunks[4].content(), "![image_1](https://p/b.webp)\n");
        assert_eq!(chunks[5].finish_reason(), Some("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_notice_keeps_stream_open() {
        let job = async {
            sleep(Duration::from_secs(12)).await;
            Ok(result(&["https://v/x.mp4"]))
        };
        let chunks = collect(spawn_emitter(&config(7_000, 1500), JobKind::Video, job)).await;

        assert_eq!(
            shape(&chunks),
            ["started", "heartbeat", "notice", "heartbeat", "asset", "final", "done"]
        );
        assert!(chunks[2].content().contains(HISTORY_PAGE));
        assert_eq!(chunks[2].finish_reason(), None);
        assert_eq!(chunks[4].content(), "![video](https://v/x.mp4)\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_becomes_final_chunk_with_record_id() {
        let job = async {
            Err(JimengError::TimedOut {
                correlation_id: "7391".into(),
            })
        };
        let chunks = collect(spawn_emitter(&config(120_000, 1500), JobKind::Video, job)).await;

        assert_eq!(shape(&chunks), ["started", "failed", "done"]);
        assert!(chunks[1].content().contains("7391"));
        assert!(chunks[1].content().contains(HISTORY_PAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_bound_ends_stream() {
        let job = futures::future::pending::<Result<GenerationResult>>();
        let chunks = collect(spawn_emitter(&config(7_000, 12), JobKind::Video, job)).await;

        assert_eq!(
            shape(&chunks),
            ["started", "heartbeat", "notice", "heartbeat", "failed", "done"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_does_not_cancel_job() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let job = async move {
            sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(result(&["https://p/a.webp"]))
        };

        let mut rx = spawn_emitter(&config(120_000, 1500), JobKind::Image, job);
        assert!(matches!(rx.recv().await, Some(StreamChunk::Started(_))));
        drop(rx);

        sleep(Duration::from_secs(31)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_still_terminates() {
        let mut cfg = config(120_000, 1500);
        cfg.heartbeat_ms = 0;
        let job = async {
            sleep(Duration::from_millis(50)).await;
            Err(JimengError::UploadFailed("gone".into()))
        };
        let chunks = collect(spawn_emitter(&cfg, JobKind::Image, job)).await;

        assert_eq!(shape(&chunks), ["started", "failed", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_does_not_block_job() {
        let mut cfg = config(120_000, 10);
        cfg.heartbeat_ms = 1_000;
        cfg.channel_capacity = 1;
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let job = async move {
            sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(result(&["https://p/a.webp"]))
        };

        let mut rx = spawn_emitter(&cfg, JobKind::Image, job);
        sleep(Duration::from_secs(6)).await;
        assert!(finished.load(Ordering::SeqCst));

        // The emitter gives up on the unread asset and drops its sender.
        sleep(FLUSH_GRACE + Duration::from_secs(10)).await;
        assert!(matches!(rx.recv().await, Some(StreamChunk::Started(_))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_still_hits_lifetime_bound() {
        let mut cfg = config(7_000, 10);
        cfg.heartbeat_ms = 1_000;
        cfg.channel_capacity = 1;
        let job = futures::future::pending::<Result<GenerationResult>>();

        let mut rx = spawn_emitter(&cfg, JobKind::Video, job);
        sleep(Duration::from_secs(10) + FLUSH_GRACE + Duration::from_secs(1)).await;

        assert!(matches!(rx.recv().await, Some(StreamChunk::Started(_))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_gets_content_and_done() {
        let mut cfg = config(120_000, 1500);
        cfg.heartbeat_ms = 1_000;
        cfg.channel_capacity = 1;
        let job = async {
            sleep(Duration::from_secs(5)).await;
            Ok(result(&["https://p/a.webp", "https://p/b.webp"]))
        };

        let rx = spawn_emitter(&cfg, JobKind::Image, job);
        sleep(Duration::from_secs(8)).await;
        let chunks = collect(rx).await;

        // Heartbeats were dropped while the slot was taken
        assert_eq!(shape(&chunks), ["started", "asset", "asset", "final", "done"]);
    }

    #[test]
    fn test_failure_text_without_correlation() {
        let text = failure_text(JobKind::Image, &JimengError::NoRecordId);
        assert!(text.contains("Image generation failed"));
        assert!(!text.contains("Record id"));
    }
}
