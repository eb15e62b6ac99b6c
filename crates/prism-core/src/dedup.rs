//! Input dedup cache
//!
//! Resolves an external source URL to a stable reference under this
//! system's own storage domain. The same popular image URL submitted by
//! many clients is fetched and persisted exactly once; every later
//! reference resolves through the recorded mapping with no network
//! access. The mapping is append-only.

use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::AnalysisError;
use crate::schema::cached_inputs;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Cached mapping row from the database
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = cached_inputs)]
pub struct CachedInput {
    pub id: i32,
    pub source_url: String,
    pub content_type: String,
    pub storage_id: String,
    pub created_at: DateTime<Utc>,
}

/// New mapping to insert
#[derive(Insertable)]
#[diesel(table_name = cached_inputs)]
struct NewCachedInput<'a> {
    source_url: &'a str,
    content_type: &'a str,
    storage_id: &'a str,
}

pub struct InputCache {
    conn: Arc<Mutex<PgConnection>>,
    http: reqwest::Client,
    blob: BlobStore,
    public_base_url: String,
}

impl InputCache {
    pub fn new(
        conn: Arc<Mutex<PgConnection>>,
        blob: BlobStore,
        public_base_url: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("Prism/0.1.0")
            .build()?;

        Ok(Self {
            conn,
            http,
            blob,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a source URL to its canonical reference.
    ///
    /// A URL already under our own storage domain is returned unchanged
    /// (nothing to fetch, and re-ingesting our own output would chain
    /// forever). A known URL resolves through the recorded mapping. An
    /// unknown URL is fetched, persisted, and recorded; only the
    /// successful persist-and-record pair yields a reference.
    pub async fn resolve(&self, source_url: &str) -> Result<String, AnalysisError> {
        if source_url.starts_with(&self.public_base_url) {
            return Ok(source_url.to_string());
        }

        if let Some(entry) = self.lookup(source_url)? {
            debug!("Dedup cache hit for {} -> {}", source_url, entry.storage_id);
            return Ok(self.public_url(&entry.storage_id));
        }

        let response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|e| AnalysisError::FetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::FetchFailed(format!(
                "{} responded with {}",
                source_url, status
            )));
        }

        // The content type is mandatory: it yields the storage suffix.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .ok_or_else(|| {
                AnalysisError::FetchFailed(format!("{} sent no content type", source_url))
            })?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalysisError::FetchFailed(e.to_string()))?;

        let storage_id = storage_id_for(&content_type);
        self.blob
            .put(&storage_id, &bytes)
            .await
            .map_err(|e| AnalysisError::PersistFailed(e.to_string()))?;
        self.record(source_url, &content_type, &storage_id)
            .map_err(|e| AnalysisError::PersistFailed(e.to_string()))?;

        info!(
            "Cached {} as {} ({}, {} bytes)",
            source_url,
            storage_id,
            content_type,
            bytes.len()
        );

        Ok(self.public_url(&storage_id))
    }

    fn lookup(&self, source_url: &str) -> Result<Option<CachedInput>, AnalysisError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AnalysisError::FetchFailed("cache lock poisoned".to_string()))?;

        cached_inputs::table
            .filter(cached_inputs::source_url.eq(source_url))
            .select(CachedInput::as_select())
            .first(&mut *conn)
            .optional()
            .map_err(|e| AnalysisError::FetchFailed(e.to_string()))
    }

    fn record(&self, source_url: &str, content_type: &str, storage_id: &str) -> Result<()> {
        let new_entry = NewCachedInput {
            source_url,
            content_type,
            storage_id,
        };

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        diesel::insert_into(cached_inputs::table)
            .values(&new_entry)
            .execute(&mut *conn)?;

        Ok(())
    }

    fn public_url(&self, storage_id: &str) -> String {
        format!("{}/{}", self.public_base_url, storage_id)
    }
}

/// Globally-unique storage identifier: random id plus an extension
/// derived from the content-type subtype.
fn storage_id_for(content_type: &str) -> String {
    let subtype = content_type.split('/').nth(1).unwrap_or("bin");
    format!("{}.{}", Uuid::new_v4().simple(), subtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_id_extension() {
        let id = storage_id_for("image/jpeg");
        assert!(id.ends_with(".jpeg"));

        let id = storage_id_for("image/png");
        assert!(id.ends_with(".png"));

        // No subtype at all falls back to a generic suffix
        let id = storage_id_for("weird");
        assert!(id.ends_with(".bin"));
    }

    #[test]
    fn test_storage_ids_are_unique() {
        assert_ne!(storage_id_for("image/png"), storage_id_for("image/png"));
    }
}
