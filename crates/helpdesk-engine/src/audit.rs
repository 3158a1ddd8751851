use chrono::NaiveDateTime;
use helpdesk_contracts::{Actor, TicketId};
use helpdesk_kernel::{format_timestamp, jcs_sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only, hash-chained JSONL trail of every state change.
pub(crate) struct AuditJsonl {
    inner: Mutex<AuditSink>,
}

struct AuditSink {
    file: tokio::fs::File,
    immutable_mirror: Option<tokio::fs::File>,
    last_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub audit_id: String,
    pub action: String,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    pub ts: String,
    #[serde(default)]
    pub detail: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub(crate) fn new(
        action: &str,
        actor: Actor,
        ticket_id: Option<TicketId>,
        at: NaiveDateTime,
        detail: Value,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            action: action.to_string(),
            actor,
            ticket_id,
            ts: format_timestamp(at),
            detail,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal(&mut self, prev_hash: Option<String>) -> Result<(), String> {
        self.prev_hash = prev_hash;
        self.record_hash = self.expected_hash()?;
        Ok(())
    }

    fn expected_hash(&self) -> Result<String, String> {
        let mut seed = self.clone();
        seed.record_hash.clear();
        let value = serde_json::to_value(&seed).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    pub(crate) async fn open(
        path: &str,
        immutable_mirror_path: Option<&str>,
    ) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open audit log {path}: {e}"))?;

        let immutable_mirror = match immutable_mirror_path {
            Some(mirror) if !mirror.is_empty() => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(mirror)
                    .await
                    .map_err(|e| format!("open audit mirror {mirror}: {e}"))?,
            ),
            _ => None,
        };

        Ok(Self {
            inner: Mutex::new(AuditSink {
                file,
                immutable_mirror,
                last_hash,
            }),
        })
    }

    pub(crate) async fn append(&self, mut rec: AuditRecord) -> Result<(), String> {
        let mut sink = self.inner.lock().await;
        rec.seal(sink.last_hash.clone())?;
        let mut line = serde_json::to_string(&rec).map_err(|e| e.to_string())?;
        line.push('\n');

        sink.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        sink.file.flush().await.map_err(|e| e.to_string())?;
        // The primary now holds the record, so the chain continues from it even if the mirror
        // write fails below.
        sink.last_hash = Some(rec.record_hash);

        if let Some(mirror) = sink.immutable_mirror.as_mut() {
            mirror
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("audit mirror: {e}"))?;
            mirror
                .flush()
                .await
                .map_err(|e| format!("audit mirror: {e}"))?;
        }
        Ok(())
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let count = verify_chain_text(&text)?;
    Ok(format!("audit chain verified: {count} records"))
}

/// Verifies the primary chain and requires the mirror to hold the same records.
pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror) = mirror else {
        return Ok(summary);
    };
    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let copy = std::fs::read_to_string(mirror).map_err(|e| e.to_string())?;
    verify_chain_text(&copy).map_err(|e| format!("mirror: {e}"))?;

    let primary_lines: Vec<&str> = primary.lines().filter(|l| !l.trim().is_empty()).collect();
    let mirror_lines: Vec<&str> = copy.lines().filter(|l| !l.trim().is_empty()).collect();
    if primary_lines.len() != mirror_lines.len() {
        return Err(format!(
            "mirror record count mismatch: primary {}, mirror {}",
            primary_lines.len(),
            mirror_lines.len()
        ));
    }
    if let Some(idx) = primary_lines
        .iter()
        .zip(mirror_lines.iter())
        .position(|(a, b)| a != b)
    {
        return Err(format!("mirror diverges from primary at line {}", idx + 1));
    }
    Ok(format!("{summary}; mirror matches"))
}

fn verify_chain_text(text: &str) -> Result<usize, String> {
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .expected_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(count)
}
