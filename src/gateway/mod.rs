//! Session coordinator: one worker at a time per Discord thread.
//!
//! Owns the single-flight rule, the prompt -> worker -> streamed reply
//! pipeline, and the admin command semantics. Platform delivery goes
//! through the [`Delivery`] seam so the whole lifecycle is testable with
//! stub worker binaries and a recording delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::discord::Delivery;
use crate::retrieval::Retriever;
use crate::session::{SessionRecord, SessionStatus, SessionStore, identity};
use crate::stream;
use crate::worker::{self, WorkerEvent, WorkerInvocation};

/// How a completed run ended. Carried by [`Gateway::handle_prompt`] for
/// callers that want to observe the outcome; user-facing delivery already
/// happened by the time this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Rejected: the thread already had a worker running.
    Busy,
    /// Worker could not be spawned at all.
    SpawnFailed,
    /// Worker exited zero; reply delivered.
    Success,
    /// Worker exited non-zero.
    ProcessError { code: i32 },
    /// No output within the configured window; worker killed.
    TimedOut,
    /// Cancelled via `!cancel`.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset { session_id: String },
    Busy,
}

struct ActiveRun {
    cancel: CancellationToken,
}

pub struct Gateway<D: Delivery> {
    config: Config,
    store: SessionStore,
    retriever: Retriever,
    delivery: D,
    /// Threads with a worker in flight. Claimed before spawn, released on
    /// every exit path.
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl<D: Delivery> Gateway<D> {
    pub fn new(config: Config, store: SessionStore, retriever: Retriever, delivery: D) -> Self {
        Self {
            config,
            store,
            retriever,
            delivery,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn delivery(&self) -> &D {
        &self.delivery
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn is_busy(&self, thread_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(thread_id)
    }

    /// Runs one prompt through the thread's worker session, streaming the
    /// reply into the thread as it arrives.
    pub async fn handle_prompt(&self, thread_id: &str, thread_name: &str, prompt: &str) -> RunOutcome {
        // Claim the thread's slot before any await so two concurrent prompts
        // cannot both pass the check.
        let slot = {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(thread_id) {
                None
            } else {
                let cancel = CancellationToken::new();
                active.insert(thread_id.to_string(), ActiveRun { cancel: cancel.clone() });
                Some(cancel)
            }
        };
        let Some(slot_token) = slot else {
            self.deliver_notice(
                thread_id,
                "\u{23f3} Still working on the previous request. Use `!cancel` to stop it.",
            )
            .await;
            return RunOutcome::Busy;
        };

        let outcome = self.run_prompt(thread_id, thread_name, prompt, slot_token).await;

        self.active.lock().unwrap().remove(thread_id);
        self.set_status(thread_id, SessionStatus::Idle);
        outcome
    }

    async fn run_prompt(
        &self,
        thread_id: &str,
        thread_name: &str,
        prompt: &str,
        slot_token: CancellationToken,
    ) -> RunOutcome {
        let mut record = self
            .store
            .get(thread_id)
            .unwrap_or_else(|| SessionRecord::new(thread_id, identity::derive(thread_id, "")));
        record.touch();
        record.status = SessionStatus::Running;
        if let Err(err) = self.store.upsert(record.clone()) {
            warn!("failed to persist session record: {:#}", err);
        }

        let resume = record.has_started;
        let full_prompt = if resume {
            prompt.to_string()
        } else {
            // Fresh session: index any new transcripts, then front-load
            // relevant history into the first prompt.
            if let Err(err) = self.retriever.ensure_indexed().await {
                warn!("transcript indexing failed: {:#}", err);
            }
            self.augment_prompt(prompt).await
        };

        let model = self.effective_model(&record);
        let invocation = WorkerInvocation::for_session(
            &self.config.worker,
            &record.session_id,
            resume,
            model.as_deref(),
            &full_prompt,
        );

        info!(
            thread_id,
            session_id = %record.session_id,
            resume,
            "starting worker"
        );

        let mut handle = match worker::start(&invocation, self.config.worker_timeout()) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("worker spawn failed: {:#}", err);
                self.deliver_notice(
                    thread_id,
                    &format!("\u{274c} Failed to start worker: {err:#}"),
                )
                .await;
                return RunOutcome::SpawnFailed;
            }
        };

        // Cancellation requested between the slot claim and spawn must not
        // be lost; afterwards the slot token drives the worker directly.
        // `cancel()` takes the same lock, so checking the old token after
        // the swap, still under the lock, leaves no window.
        {
            let worker_token = handle.cancel_token();
            let mut active = self.active.lock().unwrap();
            if let Some(run) = active.get_mut(thread_id) {
                run.cancel = worker_token.clone();
            }
            if slot_token.is_cancelled() {
                worker_token.cancel();
            }
        }

        let (aggregated, stream_message) = self.stream_reply(thread_id, &mut handle).await;

        match aggregated.terminal {
            WorkerEvent::Exited { code: 0 } => {
                let reply = if aggregated.text.trim().is_empty() {
                    "(no output)".to_string()
                } else {
                    aggregated.text.clone()
                };
                self.deliver_reply(thread_id, stream_message.as_deref(), &reply).await;

                // Re-read before persisting: a `!model` issued while the
                // worker streamed must not be overwritten by our stale copy.
                let mut record = self.store.get(thread_id).unwrap_or(record);
                record.has_started = true;
                record.touch();
                record.status = SessionStatus::Idle;
                if let Err(err) = self.store.upsert(record) {
                    warn!("failed to persist session record: {:#}", err);
                }

                if let Err(err) =
                    self.retriever.log_exchange(thread_id, thread_name, prompt.trim(), &reply)
                {
                    warn!("transcript logging failed: {:#}", err);
                }
                RunOutcome::Success
            }
            WorkerEvent::Exited { code } => {
                self.deliver_notice(
                    thread_id,
                    &format!("\u{274c} Worker exited with code {code}."),
                )
                .await;
                RunOutcome::ProcessError { code }
            }
            WorkerEvent::TimedOut => {
                let secs = self.config.worker.timeout_secs;
                self.deliver_notice(
                    thread_id,
                    &format!("\u{23f1}\u{fe0f} No output for {secs}s; worker stopped. Partial reply kept above."),
                )
                .await;
                RunOutcome::TimedOut
            }
            WorkerEvent::Cancelled => {
                self.deliver_notice(thread_id, "\u{1f6d1} Cancelled.").await;
                RunOutcome::Cancelled
            }
            WorkerEvent::Chunk(_) => unreachable!("aggregate never returns a chunk as terminal"),
        }
    }

    /// Drains the worker's events while rendering progress snapshots as one
    /// evolving message. Returns the aggregate and the streaming message id,
    /// if one was sent.
    async fn stream_reply(
        &self,
        thread_id: &str,
        handle: &mut worker::WorkerHandle,
    ) -> (stream::Aggregated, Option<String>) {
        let limit = self.config.stream.max_message_len;
        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(8);
        let mut message_id: Option<String> = None;

        let aggregated = {
            let agg = stream::aggregate(&mut handle.events, self.config.stream_interval(), &progress_tx);
            tokio::pin!(agg);
            loop {
                tokio::select! {
                    aggregated = &mut agg => break aggregated,
                    Some(snapshot) = progress_rx.recv() => {
                        let shown = tail_view(&snapshot, limit);
                        match &message_id {
                            None => match self.delivery.send(thread_id, &shown).await {
                                Ok(id) => message_id = Some(id),
                                Err(err) => warn!("progress send failed: {:#}", err),
                            },
                            Some(id) => {
                                if let Err(err) = self.delivery.edit(thread_id, id, &shown).await {
                                    warn!("progress edit failed: {:#}", err);
                                }
                            }
                        }
                    }
                }
            }
        };

        (aggregated, message_id)
    }

    /// Delivers the final reply: the first chunk replaces the streaming
    /// message, overflow chunks follow as separate messages.
    async fn deliver_reply(&self, thread_id: &str, stream_message: Option<&str>, reply: &str) {
        let chunks = stream::chunk_text(reply, self.config.stream.max_message_len);
        let mut chunks = chunks.into_iter();

        if let Some(first) = chunks.next() {
            let result = match stream_message {
                Some(id) => self.delivery.edit(thread_id, id, &first).await,
                None => self.delivery.send(thread_id, &first).await.map(|_| ()),
            };
            if let Err(err) = result {
                warn!("reply delivery failed: {:#}", err);
            }
        }

        for chunk in chunks {
            if let Err(err) = self.delivery.send(thread_id, &chunk).await {
                warn!("reply delivery failed: {:#}", err);
            }
        }
    }

    async fn deliver_notice(&self, thread_id: &str, text: &str) {
        if let Err(err) = self.delivery.send(thread_id, text).await {
            warn!("notice delivery failed: {:#}", err);
        }
    }

    /// Prepends retrieved history to a fresh session's first prompt.
    async fn augment_prompt(&self, prompt: &str) -> String {
        let hits = self.retriever.search(prompt, None).await;
        if hits.is_empty() {
            return prompt.to_string();
        }

        let mut augmented = String::from("Relevant context from past sessions:\n\n");
        for hit in &hits {
            augmented.push_str(&format!("[{}]\n{}\n\n", hit.file_name, hit.content));
        }
        augmented.push_str("---\n\n");
        augmented.push_str(prompt);
        augmented
    }

    /// Model flag for this run, if any.
    ///
    /// A thread override always wins. Without one, the configured default is
    /// used unless `extra_args` already carries a `--model` of its own.
    fn effective_model(&self, record: &SessionRecord) -> Option<String> {
        if let Some(model) = &record.model {
            return Some(model.clone());
        }
        if self.config.worker.extra_args.iter().any(|arg| arg == "--model") {
            return None;
        }
        let default = self.config.default_model();
        if default.is_empty() {
            None
        } else {
            Some(default.to_string())
        }
    }

    /// Requests cancellation of the thread's running worker, if any.
    pub fn cancel(&self, thread_id: &str) -> CancelOutcome {
        let active = self.active.lock().unwrap();
        match active.get(thread_id) {
            Some(run) => {
                run.cancel.cancel();
                drop(active);
                self.set_status(thread_id, SessionStatus::Cancelling);
                info!(thread_id, "cancellation requested");
                CancelOutcome::Requested
            }
            None => CancelOutcome::NotRunning,
        }
    }

    /// Starts the thread over with a fresh worker session.
    ///
    /// Refused while a worker is running; `!cancel` first. The model
    /// override is a thread preference and survives the reset.
    pub fn reset(&self, thread_id: &str) -> ResetOutcome {
        if self.is_busy(thread_id) {
            return ResetOutcome::Busy;
        }

        let session_id = identity::derive(thread_id, &identity::reset_salt());
        let mut record = self
            .store
            .get(thread_id)
            .unwrap_or_else(|| SessionRecord::new(thread_id, session_id.clone()));
        record.session_id = session_id.clone();
        record.has_started = false;
        record.status = SessionStatus::Idle;
        record.touch();
        if let Err(err) = self.store.upsert(record) {
            warn!("failed to persist session record: {:#}", err);
        }

        info!(thread_id, session_id = %session_id, "session reset");
        ResetOutcome::Reset { session_id }
    }

    /// Sets or clears the thread's model override. `None` (or "default")
    /// falls back to the configured default.
    pub fn set_model(&self, thread_id: &str, model: Option<String>) -> String {
        let model = model.filter(|m| !m.eq_ignore_ascii_case("default"));

        let mut record = self
            .store
            .get(thread_id)
            .unwrap_or_else(|| SessionRecord::new(thread_id, identity::derive(thread_id, "")));
        record.model = model.clone();
        record.touch();
        if let Err(err) = self.store.upsert(record) {
            warn!("failed to persist session record: {:#}", err);
        }

        match model {
            Some(model) => format!("\u{2705} Model set to `{model}` for this thread."),
            None => format!(
                "\u{2705} Model override cleared; using `{}`.",
                self.config.default_model()
            ),
        }
    }

    /// Human-readable state summary for `!status`.
    pub fn status_report(&self, thread_id: &str) -> String {
        let busy = self.is_busy(thread_id);
        let retrieval = self.retriever.status();

        let mut lines = Vec::new();
        match self.store.get(thread_id) {
            Some(record) => {
                let state = if busy {
                    "running"
                } else {
                    record.status.display_name()
                };
                lines.push(format!("**Session** `{}` ({state})", record.session_id));
                lines.push(format!(
                    "**Model** {}",
                    record.model.as_deref().unwrap_or(self.config.default_model())
                ));
                lines.push(format!(
                    "**Started** {}  **Last used** {}",
                    record.created_at, record.last_used_at
                ));
            }
            None => lines.push("**Session** none yet; send a message to start one.".to_string()),
        }
        lines.push(format!(
            "**Memory** {} ({} indexed, {} pending)",
            retrieval.mode, retrieval.indexed_transcripts, retrieval.pending_transcripts
        ));
        lines.join("\n")
    }

    /// Gateway-wide summary for `!status` outside any thread.
    pub fn overview_report(&self) -> String {
        let in_flight = self.active.lock().unwrap().len();
        let retrieval = self.retriever.status();
        format!(
            "Sessions: {} known, {} running. Default model: `{}`. Memory: {}.",
            self.store.len(),
            in_flight,
            self.config.default_model(),
            retrieval.mode
        )
    }

    fn set_status(&self, thread_id: &str, status: SessionStatus) {
        if let Some(mut record) = self.store.get(thread_id) {
            record.status = status;
            if let Err(err) = self.store.upsert(record) {
                warn!("failed to persist session record: {:#}", err);
            }
        }
    }

    /// Applies an admin command and returns the reply to post.
    pub fn handle_command(&self, thread_id: &str, command: crate::commands::AdminCommand) -> String {
        use crate::commands::AdminCommand;
        match command {
            AdminCommand::Cancel => match self.cancel(thread_id) {
                CancelOutcome::Requested => "\u{1f6d1} Cancelling\u{2026}".to_string(),
                CancelOutcome::NotRunning => "Nothing is running in this thread.".to_string(),
            },
            AdminCommand::Reset => match self.reset(thread_id) {
                ResetOutcome::Reset { session_id } => {
                    format!("\u{1f504} Session reset. New session `{session_id}`.")
                }
                ResetOutcome::Busy => {
                    "\u{23f3} A request is still running; `!cancel` it before resetting.".to_string()
                }
            },
            AdminCommand::Status => self.status_report(thread_id),
            AdminCommand::Model(None) => {
                let record = self.store.get(thread_id);
                let override_model = record.and_then(|r| r.model);
                match override_model {
                    Some(model) => format!("Model: `{model}` (thread override)"),
                    None => format!("Model: `{}` (default)", self.config.default_model()),
                }
            }
            AdminCommand::Model(model @ Some(_)) => self.set_model(thread_id, model),
        }
    }
}

/// Tail of the accumulated text that fits a single message, for progress
/// edits while the full reply is still growing.
fn tail_view(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let skip = count - limit.saturating_sub(1);
    let tail: String = text.chars().skip(skip).collect();
    format!("\u{2026}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_view_keeps_short_text_intact() {
        assert_eq!(tail_view("hello", 10), "hello");
    }

    #[test]
    fn tail_view_truncates_from_the_front() {
        let out = tail_view("abcdefghij", 5);
        assert_eq!(out.chars().count(), 5);
        assert!(out.starts_with('\u{2026}'));
        assert!(out.ends_with("ghij"));
    }
}
