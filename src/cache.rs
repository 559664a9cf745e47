use crate::errors::{AppError, ResultExt};
use crate::models::{CacheEntry, CustomerRecord, Simulation};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Status stamped on every persisted entry.
pub const ENTRY_STATUS_APPROVED: &str = "APPROVED";

/// Flat file-backed store of approved offers, keyed by CPF.
///
/// Every mutation rewrites the whole file - a correctness-over-throughput
/// tradeoff that fits the low request volume. At most one entry exists per
/// CPF: upsert replaces, never appends. Mutations within the process are
/// serialized by a lock; concurrent processes are last-writer-wins.
pub struct OfferCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OfferCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> BTreeMap<String, CacheEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(
                        "Cache file {} is unreadable ({}) - starting empty",
                        self.path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::InternalError(format!("Failed to create cache directory: {}", e))
            })?;
        }

        let serialized = serde_json::to_string_pretty(entries)
            .map_err(|e| AppError::InternalError(format!("Failed to serialize cache: {}", e)))?;

        tokio::fs::write(&self.path, serialized)
            .await
            .map_err(|e| AppError::InternalError(format!("Failed to write cache file: {}", e)))
    }

    /// Writes or replaces the entry for a CPF. Always writes, even without a
    /// simulation, so customer data already gathered is preserved.
    pub async fn upsert(
        &self,
        cpf: &str,
        consent_term_id: &str,
        simulation: Option<Simulation>,
        customer: CustomerRecord,
    ) -> Result<CacheEntry, AppError> {
        let _guard = self.write_lock.lock().await;

        let entry = CacheEntry {
            cpf: cpf.to_string(),
            consent_term_id: consent_term_id.to_string(),
            simulation,
            customer,
            status: ENTRY_STATUS_APPROVED.to_string(),
            timestamp: Utc::now(),
        };

        let mut entries = self.load().await;
        entries.insert(cpf.to_string(), entry.clone());
        self.persist(&entries)
            .await
            .context(format!("Saving cache entry for {}", cpf))?;

        tracing::info!("[{}] Cache entry saved (term {})", cpf, consent_term_id);
        Ok(entry)
    }

    pub async fn read(&self, cpf: &str) -> Option<CacheEntry> {
        self.load().await.get(cpf).cloned()
    }

    pub async fn list(&self) -> Vec<CacheEntry> {
        self.load().await.into_values().collect()
    }

    /// Removes the entry for a CPF; `NotFound` when absent.
    pub async fn delete(&self, cpf: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.load().await;
        if entries.remove(cpf).is_none() {
            return Err(AppError::NotFound(format!(
                "No cache entry for CPF {}",
                cpf
            )));
        }
        self.persist(&entries).await?;

        tracing::info!("[{}] Cache entry removed", cpf);
        Ok(())
    }

    /// Shallow-merges partial fields over the existing entry and refreshes
    /// its timestamp. Fails with `NotFound` when no entry exists, and with
    /// `BadRequest` when the merge no longer forms a valid entry.
    pub async fn update(&self, cpf: &str, partial: Value) -> Result<CacheEntry, AppError> {
        let fields = match partial {
            Value::Object(map) if !map.is_empty() => map,
            _ => {
                return Err(AppError::BadRequest(
                    "Update payload must be a non-empty object".to_string(),
                ))
            }
        };

        let _guard = self.write_lock.lock().await;

        let mut entries = self.load().await;
        let existing = entries.get(cpf).ok_or_else(|| {
            AppError::NotFound(format!("No cache entry for CPF {}", cpf))
        })?;

        let mut merged = serde_json::to_value(existing)
            .map_err(|e| AppError::InternalError(format!("Failed to serialize entry: {}", e)))?;
        if let Value::Object(target) = &mut merged {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }

        let mut updated: CacheEntry = serde_json::from_value(merged).map_err(|e| {
            AppError::BadRequest(format!("Update produces an invalid cache entry: {}", e))
        })?;
        // The key and the write time are authoritative here, whatever the
        // partial carried.
        updated.cpf = cpf.to_string();
        updated.timestamp = Utc::now();

        entries.insert(cpf.to_string(), updated.clone());
        self.persist(&entries).await?;

        tracing::info!("[{}] Cache entry updated", cpf);
        Ok(updated)
    }

    /// Entry counts grouped by status, for the health endpoint.
    pub async fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.load().await.into_values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }
}
