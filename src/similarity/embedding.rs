use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{PlaybookError, Result};
use crate::time::now_ms;

use super::{Method, PatternText, SimilarityTier, cosine};

const DDL_EMBEDDINGS: &str = "\
CREATE TABLE IF NOT EXISTS embedding_cache (
    content_hash TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    vector TEXT NOT NULL,
    created_at BIGINT NOT NULL
);";

/// Persistent embedding vectors keyed by sha256 of model + text.
pub struct EmbeddingCache {
    conn: duckdb::Connection,
}

impl EmbeddingCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = duckdb::Connection::open(path)?;
        conn.execute_batch(DDL_EMBEDDINGS)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        conn.execute_batch(DDL_EMBEDDINGS)?;
        Ok(Self { conn })
    }

    pub fn key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT vector FROM embedding_cache WHERE content_hash = ?")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, model: &str, vector: &[f32]) -> Result<()> {
        let raw = serde_json::to_string(vector)?;
        self.conn.execute(
            "INSERT INTO embedding_cache (content_hash, model, vector, created_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT (content_hash) DO NOTHING",
            duckdb::params![key, model, raw, now_ms()],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Embedding similarity via an OpenAI-compatible `/embeddings` endpoint.
pub struct EmbeddingTier {
    client: reqwest::Client,
    config: EmbeddingConfig,
    cache: Option<Mutex<EmbeddingCache>>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl EmbeddingTier {
    pub fn new(
        config: EmbeddingConfig,
        timeout: Duration,
        cache: Option<EmbeddingCache>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            config,
            cache: cache.map(Mutex::new),
        })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        }
    }

    fn cached(&self, key: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?.lock().ok()?;
        match cache.get(key) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("similarity: embedding cache read failed: {e}");
                None
            }
        }
    }

    fn remember(&self, key: &str, vector: &[f32]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Ok(cache) = cache.lock() else {
            return;
        };
        if let Err(e) = cache.put(key, &self.config.model, vector) {
            tracing::warn!("similarity: embedding cache write failed: {e}");
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = EmbeddingCache::key(&self.config.model, text);
        if let Some(vector) = self.cached(&key) {
            return Ok(vector);
        }

        let mut request = self.client.post(self.endpoint()).json(&serde_json::json!({
            "model": self.config.model,
            "input": [text],
        }));
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        let body: EmbeddingResponse = response.json().await?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PlaybookError::Collaborator {
                collaborator: "embedding",
                message: "empty embedding response".to_string(),
            })?;

        self.remember(&key, &vector);
        Ok(vector)
    }
}

#[async_trait]
impl SimilarityTier for EmbeddingTier {
    fn method(&self) -> Method {
        Method::Embedding
    }

    async fn score(&self, a: &PatternText, b: &PatternText) -> Result<f64> {
        let left = self.embed(&a.combined()).await?;
        let right = self.embed(&b.combined()).await?;
        cosine(&left, &right).ok_or_else(|| PlaybookError::Collaborator {
            collaborator: "embedding",
            message: "degenerate embedding vectors".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_model_and_text() {
        let a = EmbeddingCache::key("m1", "text");
        assert_eq!(a, EmbeddingCache::key("m1", "text"));
        assert_ne!(a, EmbeddingCache::key("m2", "text"));
        assert_ne!(a, EmbeddingCache::key("m1", "text2"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cache_round_trips_vectors() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        assert!(cache.is_empty().unwrap());
        let key = EmbeddingCache::key("m", "hello");
        cache.put(&key, "m", &[0.5, -1.0]).unwrap();
        cache.put(&key, "m", &[9.0, 9.0]).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(vec![0.5, -1.0]));
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn cached_vectors_skip_the_network() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9".into(),
            model: "m".into(),
            api_key: None,
        };
        let a = PatternText::new("alpha", "");
        let b = PatternText::new("beta", "");
        cache
            .put(&EmbeddingCache::key("m", &a.combined()), "m", &[1.0, 0.0])
            .unwrap();
        cache
            .put(&EmbeddingCache::key("m", &b.combined()), "m", &[1.0, 1.0])
            .unwrap();
        let tier = EmbeddingTier::new(config, Duration::from_millis(200), Some(cache)).unwrap();
        let score = tier.score(&a, &b).await.unwrap();
        assert!((score - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9/v1".into(),
            model: "m".into(),
            api_key: None,
        };
        let tier = EmbeddingTier::new(config, Duration::from_millis(200), None).unwrap();
        let a = PatternText::new("alpha", "");
        assert!(tier.score(&a, &a).await.is_err());
    }
}
