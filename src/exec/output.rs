//! Bounded per-exec output buffers with cursor polling
//!
//! Each exec owns a ring buffer of sequenced chunks. Buffers are bounded
//! two ways: a byte cap under which new output is dropped, and a chunk cap
//! under which the oldest output chunk is evicted. The completion chunk is
//! never evicted and is always the last chunk a poller sees.

use std::collections::VecDeque;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::database::ExecUsage;

/// Default maximum buffered bytes per exec (64 MiB)
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Default maximum chunks per exec
pub const DEFAULT_MAX_CHUNKS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A sequenced buffer entry: command output or the terminal completion.
#[derive(Debug, Clone)]
pub enum Chunk {
    Output {
        seq: u64,
        stream: StreamKind,
        data: Bytes,
        ts: DateTime<Utc>,
    },
    Completion {
        seq: u64,
        exit_code: i64,
        usage: ExecUsage,
        ts: DateTime<Utc>,
    },
}

impl Chunk {
    pub fn seq(&self) -> u64 {
        match self {
            Chunk::Output { seq, .. } | Chunk::Completion { seq, .. } => *seq,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Chunk::Completion { .. })
    }

    fn ts(&self) -> DateTime<Utc> {
        match self {
            Chunk::Output { ts, .. } | Chunk::Completion { ts, .. } => *ts,
        }
    }

    /// Wire shape consumed by pollers: output data is base64, timestamps
    /// are UTC RFC 3339.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Chunk::Output {
                seq,
                stream,
                data,
                ts,
            } => json!({
                "seq": seq,
                "stream": stream.as_str(),
                "data": base64::engine::general_purpose::STANDARD.encode(data),
                "text": String::from_utf8_lossy(data),
                "ts": ts.to_rfc3339(),
            }),
            Chunk::Completion {
                seq,
                exit_code,
                usage,
                ts,
            } => json!({
                "seq": seq,
                "exit_code": exit_code,
                "usage": usage,
                "ts": ts.to_rfc3339(),
                "complete": true,
            }),
        }
    }
}

/// Diagnostic view of one exec buffer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamStats {
    pub exec_id: String,
    pub buffered_bytes: usize,
    pub chunk_count: usize,
    pub next_seq: u64,
    pub complete: bool,
}

struct ExecBuffer {
    chunks: VecDeque<Chunk>,
    next_seq: u64,
    buffered_bytes: usize,
    complete: bool,
}

impl ExecBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            next_seq: 0,
            buffered_bytes: 0,
            complete: false,
        }
    }
}

/// Per-exec buffers, independently locked. Operations on different execs
/// never contend on a shared mutex.
pub struct OutputStreamer {
    max_buffer_bytes: usize,
    max_chunks: usize,
    buffers: DashMap<String, Mutex<ExecBuffer>>,
}

impl OutputStreamer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_CHUNKS)
    }

    pub fn with_limits(max_buffer_bytes: usize, max_chunks: usize) -> Self {
        Self {
            max_buffer_bytes,
            max_chunks,
            buffers: DashMap::new(),
        }
    }

    /// Allocate an empty buffer for a new exec.
    pub fn init(&self, exec_id: &str) {
        self.buffers
            .entry(exec_id.to_string())
            .or_insert_with(|| Mutex::new(ExecBuffer::new()));
    }

    /// Append an output chunk. Returns the assigned sequence, or None when
    /// the chunk was dropped (byte cap) or the exec is unknown.
    pub fn append(&self, exec_id: &str, stream: StreamKind, data: Bytes) -> Option<u64> {
        if data.is_empty() {
            return None;
        }

        let entry = self.buffers.get(exec_id)?;
        let mut buffer = entry.lock();

        if buffer.buffered_bytes + data.len() > self.max_buffer_bytes {
            warn!(
                exec_id,
                buffered = buffer.buffered_bytes,
                dropped = data.len(),
                "output buffer full, dropping chunk"
            );
            return None;
        }

        // Chunk-count cap: evict the oldest output chunk, never a
        // completion chunk.
        if buffer.chunks.len() >= self.max_chunks {
            if let Some(index) = buffer.chunks.iter().position(|c| !c.is_completion()) {
                if let Some(Chunk::Output { data: old, .. }) = buffer.chunks.remove(index) {
                    buffer.buffered_bytes -= old.len();
                }
            }
        }

        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.buffered_bytes += data.len();
        buffer.chunks.push_back(Chunk::Output {
            seq,
            stream,
            data,
            ts: Utc::now(),
        });

        Some(seq)
    }

    /// Enqueue the single terminal completion chunk.
    pub fn complete(&self, exec_id: &str, exit_code: i64, usage: ExecUsage) -> u64 {
        let entry = self
            .buffers
            .entry(exec_id.to_string())
            .or_insert_with(|| Mutex::new(ExecBuffer::new()));
        let mut buffer = entry.lock();

        if buffer.complete {
            // Already finalized; keep the first completion.
            return buffer.next_seq.saturating_sub(1);
        }

        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.complete = true;
        buffer.chunks.push_back(Chunk::Completion {
            seq,
            exit_code,
            usage,
            ts: Utc::now(),
        });

        debug!(exec_id, exit_code, seq, "exec output completed");
        seq
    }

    /// Snapshot of chunks with `seq > after_seq` plus the completion flag.
    /// Unknown execs return an empty, incomplete view.
    pub fn poll(&self, exec_id: &str, after_seq: Option<u64>) -> (Vec<Chunk>, bool) {
        let entry = match self.buffers.get(exec_id) {
            Some(entry) => entry,
            None => return (Vec::new(), false),
        };
        let buffer = entry.lock();

        let chunks = buffer
            .chunks
            .iter()
            .filter(|c| after_seq.map_or(true, |after| c.seq() > after))
            .cloned()
            .collect();

        (chunks, buffer.complete)
    }

    pub fn stats(&self, exec_id: &str) -> Option<StreamStats> {
        let entry = self.buffers.get(exec_id)?;
        let buffer = entry.lock();
        Some(StreamStats {
            exec_id: exec_id.to_string(),
            buffered_bytes: buffer.buffered_bytes,
            chunk_count: buffer.chunks.len(),
            next_seq: buffer.next_seq,
            complete: buffer.complete,
        })
    }

    pub fn cleanup(&self, exec_id: &str) {
        self.buffers.remove(exec_id);
    }

    /// Drop buffers of completed execs whose last chunk is older than
    /// `max_age_seconds`. Returns the number of buffers freed.
    pub fn cleanup_completed_older_than(&self, max_age_seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(max_age_seconds);

        let stale: Vec<String> = self
            .buffers
            .iter()
            .filter(|entry| {
                let buffer = entry.value().lock();
                buffer.complete
                    && buffer
                        .chunks
                        .back()
                        .map(|c| c.ts() < cutoff)
                        .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for exec_id in stale {
            self.buffers.remove(&exec_id);
        }
        count
    }
}

impl Default for OutputStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_monotonic() {
        let streamer = OutputStreamer::new();
        streamer.init("e_1");

        let s0 = streamer.append("e_1", StreamKind::Stdout, Bytes::from("a")).unwrap();
        let s1 = streamer.append("e_1", StreamKind::Stderr, Bytes::from("b")).unwrap();
        let s2 = streamer.complete("e_1", 0, ExecUsage::default());

        assert_eq!((s0, s1, s2), (0, 1, 2));
    }

    #[test]
    fn test_poll_with_cursor() {
        let streamer = OutputStreamer::new();
        streamer.init("e_1");
        streamer.append("e_1", StreamKind::Stdout, Bytes::from("a"));
        streamer.append("e_1", StreamKind::Stdout, Bytes::from("b"));

        let (all, complete) = streamer.poll("e_1", None);
        assert_eq!(all.len(), 2);
        assert!(!complete);

        let (after_first, _) = streamer.poll("e_1", Some(0));
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].seq(), 1);

        streamer.complete("e_1", 0, ExecUsage::default());
        let (rest, complete) = streamer.poll("e_1", Some(1));
        assert!(complete);
        assert_eq!(rest.len(), 1);
        assert!(rest[0].is_completion());
    }

    #[test]
    fn test_byte_cap_drops_new_chunks() {
        let streamer = OutputStreamer::with_limits(8, 100);
        streamer.init("e_1");

        assert!(streamer
            .append("e_1", StreamKind::Stdout, Bytes::from("12345678"))
            .is_some());
        // Buffer is full now; new output is dropped.
        assert!(streamer
            .append("e_1", StreamKind::Stdout, Bytes::from("x"))
            .is_none());

        // Sequence stays monotone for admitted chunks.
        let seq = streamer.complete("e_1", 0, ExecUsage::default());
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_chunk_cap_evicts_oldest_output() {
        let streamer = OutputStreamer::with_limits(1024, 3);
        streamer.init("e_1");

        for i in 0..5 {
            streamer.append("e_1", StreamKind::Stdout, Bytes::from(format!("c{i}")));
        }

        let (chunks, _) = streamer.poll("e_1", None);
        assert_eq!(chunks.len(), 3);
        // The oldest two were evicted; the newest survive with their
        // original sequence numbers.
        assert_eq!(chunks[0].seq(), 2);
        assert_eq!(chunks[2].seq(), 4);
    }

    #[test]
    fn test_completion_never_evicted() {
        let streamer = OutputStreamer::with_limits(1024, 2);
        streamer.init("e_1");

        streamer.append("e_1", StreamKind::Stdout, Bytes::from("a"));
        streamer.complete("e_1", 0, ExecUsage::default());

        // Further appends would exceed the cap; the output chunk is the
        // eviction candidate, not the completion.
        for _ in 0..3 {
            streamer.append("e_1", StreamKind::Stdout, Bytes::from("late"));
        }

        let (chunks, complete) = streamer.poll("e_1", None);
        assert!(complete);
        assert!(chunks.iter().any(|c| c.is_completion()));
    }

    #[test]
    fn test_second_completion_is_ignored() {
        let streamer = OutputStreamer::new();
        streamer.init("e_1");

        streamer.complete("e_1", 0, ExecUsage::default());
        streamer.complete(
            "e_1",
            -2,
            ExecUsage {
                cancelled: true,
                ..Default::default()
            },
        );

        let (chunks, _) = streamer.poll("e_1", None);
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Completion { exit_code, .. } => assert_eq!(*exit_code, 0),
            _ => panic!("expected completion chunk"),
        }
    }

    #[test]
    fn test_execs_are_independent() {
        let streamer = OutputStreamer::new();
        streamer.init("e_1");
        streamer.init("e_2");

        streamer.append("e_1", StreamKind::Stdout, Bytes::from("one"));
        streamer.append("e_2", StreamKind::Stdout, Bytes::from("two"));
        streamer.complete("e_1", 0, ExecUsage::default());

        let (_, complete_1) = streamer.poll("e_1", None);
        let (chunks_2, complete_2) = streamer.poll("e_2", None);
        assert!(complete_1);
        assert!(!complete_2);
        assert_eq!(chunks_2.len(), 1);
        assert_eq!(chunks_2[0].seq(), 0);
    }

    #[test]
    fn test_cleanup_completed_older_than() {
        let streamer = OutputStreamer::new();
        streamer.init("e_done");
        streamer.complete("e_done", 0, ExecUsage::default());
        streamer.init("e_live");
        streamer.append("e_live", StreamKind::Stdout, Bytes::from("x"));

        // Nothing is old enough yet.
        assert_eq!(streamer.cleanup_completed_older_than(3600), 0);

        // With a zero age, completed buffers qualify; live ones do not.
        assert_eq!(streamer.cleanup_completed_older_than(-1), 1);
        let (_, complete) = streamer.poll("e_done", None);
        assert!(!complete);
        assert!(streamer.stats("e_live").is_some());
    }

    #[test]
    fn test_wire_shape() {
        let streamer = OutputStreamer::new();
        streamer.init("e_1");
        streamer.append("e_1", StreamKind::Stdout, Bytes::from("hello world"));
        streamer.complete("e_1", 0, ExecUsage::default());

        let (chunks, _) = streamer.poll("e_1", None);
        let output = chunks[0].to_wire();
        assert_eq!(output["stream"], "stdout");
        assert_eq!(output["text"], "hello world");
        assert!(output.get("complete").is_none());

        let completion = chunks[1].to_wire();
        assert_eq!(completion["complete"], true);
        assert_eq!(completion["exit_code"], 0);
    }
}
