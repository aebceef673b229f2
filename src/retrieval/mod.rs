//! Session memory: transcript logging, lazy indexing, and search.
//!
//! The gateway only sees the narrow `log_exchange` / `ensure_indexed` /
//! `search` / `status` surface. Which backend actually serves it (nothing,
//! token-overlap over the local transcripts, or an external retrieval API)
//! is resolved once at startup from config and never re-examined.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::RetrievalConfig;

/// Tracks which transcript files have been indexed, keyed by file name with
/// the size at index time (re-index on growth).
const INDEX_STATE_FILE: &str = ".indexed.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    Local,
    External,
}

impl Mode {
    fn display_name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Local => "local",
            Self::External => "external",
        }
    }
}

/// A search hit from past session transcripts.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub content: String,
    pub score: f64,
    pub file_name: String,
}

/// Snapshot for the `!status` report.
#[derive(Debug, Clone)]
pub struct RetrievalStatus {
    pub mode: &'static str,
    pub transcripts_dir: PathBuf,
    pub total_transcripts: usize,
    pub indexed_transcripts: usize,
    pub pending_transcripts: usize,
}

pub struct Retriever {
    mode: Mode,
    transcripts_dir: PathBuf,
    config: RetrievalConfig,
    http: reqwest::Client,
}

impl Retriever {
    /// Resolves the configured mode into a single capability object.
    ///
    /// `external` without a dataset id and unrecognized modes downgrade to
    /// `none` with a warning rather than failing startup.
    pub fn from_config(config: &RetrievalConfig, transcripts_dir: PathBuf) -> Self {
        let mode = match config.mode.trim().to_lowercase().as_str() {
            "none" => Mode::None,
            "local" => Mode::Local,
            "external" => {
                if config.dataset_id.trim().is_empty() {
                    warn!("retrieval.mode = external but dataset_id is empty; session memory disabled");
                    Mode::None
                } else {
                    Mode::External
                }
            }
            other => {
                warn!("unknown retrieval.mode '{}'; session memory disabled", other);
                Mode::None
            }
        };

        match mode {
            Mode::None => info!("session memory disabled"),
            Mode::Local => info!("session memory: local transcript search"),
            Mode::External => info!(
                "session memory: external retrieval (dataset {})",
                config.dataset_id
            ),
        }

        Self {
            mode,
            transcripts_dir,
            config: config.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Appends one completed exchange to the thread's transcript file.
    ///
    /// Fire-and-forget from the coordinator's point of view: errors are the
    /// caller's to log, never to fail the session over.
    pub fn log_exchange(
        &self,
        thread_id: &str,
        thread_name: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        if self.mode == Mode::None {
            return Ok(());
        }

        fs::create_dir_all(&self.transcripts_dir).with_context(|| {
            format!(
                "Failed to create transcripts directory {}",
                self.transcripts_dir.display()
            )
        })?;

        let path = self.transcript_path(thread_id);
        let mut entry = String::new();
        if !path.exists() {
            let title = if thread_name.is_empty() {
                thread_id
            } else {
                thread_name
            };
            entry.push_str(&format!("# Session: {title}\n\n"));
        }

        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M");
        entry.push_str(&format!(
            "## {now}\n\n**User:** {user_text}\n\n**Assistant:** {assistant_text}\n\n---\n\n"
        ));

        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("Failed to append transcript {}", path.display()))?;

        Ok(())
    }

    /// Indexes transcript files that are new or grew since last indexed.
    ///
    /// Called lazily before the first request of each fresh session.
    /// Per-file failures are logged and skipped.
    pub async fn ensure_indexed(&self) -> Result<()> {
        if self.mode == Mode::None {
            return Ok(());
        }

        fs::create_dir_all(&self.transcripts_dir).with_context(|| {
            format!(
                "Failed to create transcripts directory {}",
                self.transcripts_dir.display()
            )
        })?;

        let mut indexed = self.load_index_state();
        let pending = self.pending_files(&indexed)?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("indexing {} pending transcript(s)", pending.len());
        for path in pending {
            let name = file_name(&path);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            if self.mode == Mode::External {
                if let Err(err) = self.ingest_external(&path).await {
                    warn!("indexing failed for {}: {}", name, err);
                    continue;
                }
            }
            // Local mode searches the files directly; recording the size is
            // all the bookkeeping it needs.

            indexed.insert(name, size);
        }

        self.save_index_state(&indexed)
    }

    /// Searches past transcripts. Failures degrade to an empty result set.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Vec<SearchHit> {
        let top_k = top_k.unwrap_or(self.config.top_n);
        match self.mode {
            Mode::None => Vec::new(),
            Mode::Local => self.search_local(query, top_k),
            Mode::External => match self.search_external(query, top_k).await {
                Ok(hits) => hits,
                Err(err) => {
                    warn!("retrieval search failed: {}", err);
                    Vec::new()
                }
            },
        }
    }

    pub fn status(&self) -> RetrievalStatus {
        let indexed = self.load_index_state();
        let (total, pending) = match self.pending_files(&indexed) {
            Ok(pending) => (
                self.transcript_files().map(|f| f.len()).unwrap_or(0),
                pending.len(),
            ),
            Err(_) => (0, 0),
        };

        RetrievalStatus {
            mode: self.mode.display_name(),
            transcripts_dir: self.transcripts_dir.clone(),
            total_transcripts: total,
            indexed_transcripts: indexed.len(),
            pending_transcripts: pending,
        }
    }

    fn transcript_path(&self, thread_id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{thread_id}.md"))
    }

    fn transcript_files(&self) -> Result<Vec<PathBuf>> {
        if !self.transcripts_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.transcripts_dir)
            .context("Failed to read transcripts directory")?
        {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn pending_files(&self, indexed: &HashMap<String, u64>) -> Result<Vec<PathBuf>> {
        Ok(self
            .transcript_files()?
            .into_iter()
            .filter(|path| {
                let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                indexed.get(&file_name(path)) != Some(&size)
            })
            .collect())
    }

    fn load_index_state(&self) -> HashMap<String, u64> {
        let path = self.transcripts_dir.join(INDEX_STATE_FILE);
        fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    fn save_index_state(&self, indexed: &HashMap<String, u64>) -> Result<()> {
        let path = self.transcripts_dir.join(INDEX_STATE_FILE);
        let contents =
            serde_json::to_string_pretty(indexed).context("Failed to serialize index state")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write index state to {}", path.display()))
    }

    /// Uploads a transcript to the external API and triggers chunking.
    async fn ingest_external(&self, path: &Path) -> Result<()> {
        let base = self.config.base_url.trim_end_matches('/');
        let dataset = &self.config.dataset_id;
        let name = file_name(path);

        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.clone())
            .mime_str("text/markdown")
            .context("Invalid transcript mime type")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{base}/api/v1/datasets/{dataset}/documents"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|_| anyhow!("Retrieval upload request failed"))?;
        if !response.status().is_success() {
            bail!("Retrieval upload failed: HTTP {}", response.status());
        }

        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|_| anyhow!("Failed to decode retrieval upload response"))?;
        let doc_id = upload
            .first_document_id()
            .ok_or_else(|| anyhow!("Retrieval upload returned no document id"))?;

        let response = self
            .http
            .post(format!("{base}/api/v1/datasets/{dataset}/chunks"))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({ "document_ids": [doc_id] }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|_| anyhow!("Retrieval parse request failed"))?;
        if !response.status().is_success() {
            bail!("Retrieval parse failed: HTTP {}", response.status());
        }

        info!("indexed {} as document {}", name, &doc_id[..doc_id.len().min(8)]);
        Ok(())
    }

    async fn search_external(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let base = self.config.base_url.trim_end_matches('/');
        let payload = serde_json::json!({
            "question": query,
            "dataset_ids": [self.config.dataset_id],
            "top_n": top_k,
        });

        let response = self
            .http
            .post(format!("{base}/api/v1/retrieval"))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|_| anyhow!("Retrieval search request failed"))?;
        if !response.status().is_success() {
            bail!("Retrieval search failed: HTTP {}", response.status());
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|_| anyhow!("Failed to decode retrieval search response"))?;

        Ok(body
            .data
            .chunks
            .into_iter()
            .map(|chunk| SearchHit {
                content: chunk.content,
                score: chunk.similarity,
                file_name: chunk.document_name,
            })
            .collect())
    }

    /// Token-overlap search over the local transcripts.
    ///
    /// A stand-in for a real embedding index: each `---`-separated exchange
    /// block is scored by the fraction of query tokens it contains.
    fn search_local(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let files = match self.transcript_files() {
            Ok(files) => files,
            Err(err) => {
                warn!("local search failed: {}", err);
                return Vec::new();
            }
        };

        let mut hits = Vec::new();
        for path in files {
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            let name = file_name(&path);
            for block in contents.split("\n---\n") {
                let block = block.trim();
                if block.is_empty() {
                    continue;
                }
                let block_tokens = tokenize(block);
                let overlap = query_tokens.intersection(&block_tokens).count();
                if overlap == 0 {
                    continue;
                }
                hits.push(SearchHit {
                    content: block.to_string(),
                    score: overlap as f64 / query_tokens.len() as f64,
                    file_name: name.clone(),
                });
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        hits
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    data: serde_json::Value,
}

impl UploadResponse {
    /// The upload endpoint returns either a document object or a list of
    /// them; take the first id either way.
    fn first_document_id(&self) -> Option<String> {
        let doc = match &self.data {
            serde_json::Value::Array(items) => items.first()?,
            doc @ serde_json::Value::Object(_) => doc,
            _ => return None,
        };
        doc.get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: SearchData,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    chunks: Vec<SearchChunk>,
}

#[derive(Debug, Deserialize)]
struct SearchChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    similarity: f64,
    #[serde(default)]
    document_name: String,
}
