use crate::error::RebalancerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Payload of one audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub stage: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}

/// Hash-chained audit entry. `subject` is an owner, session id or action id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub index: u64,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only audit log of accepted state changes.
///
/// No mutation API is exposed: rejected calls never reach the log, and every
/// accepted one adds exactly one entry.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild a log from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Result<Self, RebalancerError> {
        check_entries(&entries)?;
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Swap in persisted entries after verifying them; the log is untouched on error.
    pub fn replace(&self, entries: Vec<LedgerEntry>) -> Result<(), RebalancerError> {
        check_entries(&entries)?;
        *self
            .entries
            .lock()
            .map_err(|_| RebalancerError::LockPoisoned("audit log"))? = entries;
        Ok(())
    }

    pub fn record(
        &self,
        subject: &str,
        timestamp: DateTime<Utc>,
        event: AuditEvent,
    ) -> Result<LedgerEntry, RebalancerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RebalancerError::LockPoisoned("audit log"))?;

        let index = entries.len() as u64;
        let previous_hash = entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            subject,
            timestamp,
            &event,
            previous_hash.as_deref(),
        );

        let entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            subject: subject.to_string(),
            timestamp,
            event,
            previous_hash,
            entry_hash,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, RebalancerError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| RebalancerError::LockPoisoned("audit log"))?
            .clone())
    }

    pub fn entries_for(&self, subject: &str) -> Result<Vec<LedgerEntry>, RebalancerError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| RebalancerError::LockPoisoned("audit log"))?;
        Ok(entries
            .iter()
            .filter(|entry| entry.subject == subject)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn verify_chain(&self) -> bool {
        match self.entries.lock() {
            Ok(entries) => chain_is_intact(&entries),
            Err(_) => false,
        }
    }
}

fn check_entries(entries: &[LedgerEntry]) -> Result<(), RebalancerError> {
    for (expected_index, entry) in entries.iter().enumerate() {
        if entry.index != expected_index as u64 {
            return Err(RebalancerError::Serialization(format!(
                "audit index gap at position {} (found {})",
                expected_index, entry.index
            )));
        }
    }

    if !chain_is_intact(entries) {
        return Err(RebalancerError::Serialization(
            "persisted audit hash-chain verification failed".to_string(),
        ));
    }
    Ok(())
}

fn chain_is_intact(entries: &[LedgerEntry]) -> bool {
    let mut previous_hash: Option<String> = None;
    for entry in entries {
        let expected_hash = compute_entry_hash(
            entry.index,
            &entry.subject,
            entry.timestamp,
            &entry.event,
            previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash || entry.previous_hash != previous_hash {
            return false;
        }
        previous_hash = Some(entry.entry_hash.clone());
    }
    true
}

fn compute_entry_hash(
    index: u64,
    subject: &str,
    timestamp: DateTime<Utc>,
    event: &AuditEvent,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "subject": subject,
        "timestamp": timestamp,
        "stage": event.stage,
        "detail": event.detail,
        "previous_hash": previous_hash,
    });

    blake3::hash(material.to_string().as_bytes())
        .to_hex()
        .to_string()
}
