//! Stream aggregation: turns raw worker output into rate-limited progress
//! snapshots and a final, delivery-sized chunk sequence.
//!
//! The emit decision is a pure function of the clock values handed to it
//! (no timers inside), so the rate limiting is testable without sleeping.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::worker::WorkerEvent;

/// Decides when a progress snapshot may be emitted.
///
/// Emission requires both that the accumulated text changed since the last
/// emission and that at least `interval` has passed. Accumulated text only
/// ever grows, so its length is a sufficient change marker.
#[derive(Debug)]
pub struct EmitGate {
    interval: Duration,
    last_emit: Option<Instant>,
    last_len: usize,
}

impl EmitGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_len: 0,
        }
    }

    /// Returns true when a snapshot of `accumulated_len` chars should be
    /// emitted at `now`, and records the emission.
    pub fn should_emit(&mut self, now: Instant, accumulated_len: usize) -> bool {
        if accumulated_len == self.last_len {
            return false;
        }
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.interval
        {
            return false;
        }
        self.last_emit = Some(now);
        self.last_len = accumulated_len;
        true
    }
}

/// Splits text into ordered chunks of at most `limit` characters, preferring
/// to cut at a newline, then a space, nearest the limit. Each split consumes
/// exactly one separator character, so rejoining the chunks with that
/// character reconstructs the text.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    assert!(limit > 0, "chunk limit must be positive");

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        // Byte offset just past the limit-th character.
        let boundary = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(i, _)| i);
        let head = &rest[..boundary];

        let (cut, split_char) = match head.rfind('\n') {
            Some(i) if i > 0 => (i, Some('\n')),
            _ => match head.rfind(' ') {
                Some(i) if i > 0 => (i, Some(' ')),
                _ => (boundary, None),
            },
        };

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
        if let Some(ch) = split_char {
            // Exactly one separator is consumed per split; the rest of a
            // whitespace run belongs to the text.
            rest = rest.strip_prefix(ch).unwrap_or(rest);
        }
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }

    chunks
}

/// Result of draining a worker's event stream.
#[derive(Debug)]
pub struct Aggregated {
    /// Full accumulated stdout.
    pub text: String,
    /// The stream's terminal event (never `Chunk`).
    pub terminal: WorkerEvent,
}

/// Consumes a worker's event stream until its terminal event.
///
/// Progress snapshots (the accumulated text so far) are sent on `progress`
/// at most once per `interval` and only when the text changed; the receiver
/// renders them as one evolving message edit. Snapshot delivery is
/// best-effort: a closed receiver stops snapshots without affecting the
/// final result.
pub async fn aggregate(
    events: &mut mpsc::Receiver<WorkerEvent>,
    interval: Duration,
    progress: &mpsc::Sender<String>,
) -> Aggregated {
    let mut gate = EmitGate::new(interval);
    let mut text = String::new();
    // Ticks cover the case where a chunk landed during the cool-down and
    // the worker then went quiet: the next tick flushes it.
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = ticker.tick() => {
                if gate.should_emit(Instant::now(), text.chars().count()) {
                    let _ = progress.send(text.clone()).await;
                }
                continue;
            }
        };

        match event {
            Some(WorkerEvent::Chunk(chunk)) => {
                text.push_str(&chunk);
                if gate.should_emit(Instant::now(), text.chars().count()) {
                    let _ = progress.send(text.clone()).await;
                }
            }
            Some(terminal) => {
                return Aggregated { text, terminal };
            }
            None => {
                // Supervisor dropped without a terminal event; treat as a
                // failed exit rather than hanging.
                return Aggregated {
                    text,
                    terminal: WorkerEvent::Exited { code: -1 },
                };
            }
        }
    }
}
