// audit.rs
// Adds a hash-chained audit trail for trigger decisions, jobs, promotions and rollbacks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::{LoopError, LoopResult, SafeLock};

/// Severity levels for structured audit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    /// Operator alert: needs a human
    Critical,
}

/// Core audit event record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub subject: Option<String>,
    pub context: Option<String>,
    pub severity: Severity,
}

impl AuditEvent {
    pub fn new(actor: &str, action: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            subject: None,
            context: None,
            severity: Severity::Info,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Mirror the event into the tracing stream
    pub fn trace(&self) {
        let subject = self.subject.as_deref().unwrap_or("-");
        let context = self.context.as_deref().unwrap_or("");
        match self.severity {
            Severity::Info => {
                tracing::info!(actor = %self.actor, action = %self.action, subject, "{context}")
            }
            Severity::Warn => {
                tracing::warn!(actor = %self.actor, action = %self.action, subject, "{context}")
            }
            Severity::Error => {
                tracing::error!(actor = %self.actor, action = %self.action, subject, "{context}")
            }
            Severity::Critical => tracing::error!(
                alert = true,
                actor = %self.actor,
                action = %self.action,
                subject,
                "OPERATOR ALERT: {context}"
            ),
        }
    }
}

/// One line of the audit file, linked to its predecessor by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainedLine {
    event: AuditEvent,
    hash: String,
    prev_hash: Option<String>,
}

fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Append-only JSONL audit log with SHA-256 chaining.
pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> LoopResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| LoopError::io("create audit log directory", e))?;
            }
        }
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Trace the event and append it to the chain.
    pub fn record(&self, event: AuditEvent) -> LoopResult<()> {
        event.trace();

        let mut last = self.last_hash.safe_lock()?;
        let payload = serde_json::to_string(&event)?;
        let hash = chain_hash(last.as_deref(), &payload);
        let line = ChainedLine {
            event,
            hash: hash.clone(),
            prev_hash: last.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LoopError::io("open audit log", e))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)
            .map_err(|e| LoopError::io("append audit log", e))?;

        *last = Some(hash);
        Ok(())
    }

    /// Record without propagating; audit failures must not abort the control loop.
    pub fn record_or_warn(&self, event: AuditEvent) {
        if let Err(e) = self.record(event) {
            tracing::warn!("audit write failed: {e}");
        }
    }

    pub fn events(&self) -> LoopResult<Vec<AuditEvent>> {
        Ok(read_lines(&self.path)?.into_iter().map(|l| l.event).collect())
    }

    /// Recompute the chain; returns the number of verified lines.
    pub fn verify_chain(&self) -> LoopResult<usize> {
        let lines = read_lines(&self.path)?;
        let mut prev: Option<String> = None;
        for (idx, line) in lines.iter().enumerate() {
            if line.prev_hash != prev {
                return Err(LoopError::internal(format!(
                    "audit chain broken at line {}: prev hash mismatch",
                    idx + 1
                )));
            }
            let payload = serde_json::to_string(&line.event)?;
            if chain_hash(prev.as_deref(), &payload) != line.hash {
                return Err(LoopError::internal(format!(
                    "audit chain broken at line {}: hash mismatch",
                    idx + 1
                )));
            }
            prev = Some(line.hash.clone());
        }
        Ok(lines.len())
    }
}

fn read_lines(path: &Path) -> LoopResult<Vec<ChainedLine>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| LoopError::io("open audit log", e))?;
    let mut lines = Vec::new();
    for raw in BufReader::new(file).lines() {
        let raw = raw.map_err(|e| LoopError::io("read audit log", e))?;
        if raw.trim().is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&raw)?);
    }
    Ok(lines)
}

fn read_last_hash(path: &Path) -> LoopResult<Option<String>> {
    Ok(read_lines(path)?.last().map(|l| l.hash.clone()))
}
