//! SurrealDB Handle - Connection and Operations
//!
//! Manages connection and provides methods for:
//! - shared cache rows (put / get / delete / purge)
//! - append-only audit events
//!
//! Supports both local (in-memory) and remote (WebSocket) connections.

use crate::error::StateError;
use crate::schema::{AuditRecord, CacheRecord};
use crate::Result;
use chrono::Utc;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Endpoint URL (e.g., "ws://cache.internal:8000")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "codebox")
    pub namespace: String,
    /// Database name (default: "sandbox")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl RemoteConfig {
    /// Create a new remote configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: "codebox".to_string(),
            database: "sandbox".to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - CODEBOX_SURREAL_ENDPOINT (required)
    /// - CODEBOX_SURREAL_USERNAME (required)
    /// - CODEBOX_SURREAL_PASSWORD (required)
    /// - CODEBOX_SURREAL_NAMESPACE (optional, default: "codebox")
    /// - CODEBOX_SURREAL_DATABASE (optional, default: "sandbox")
    /// - CODEBOX_SURREAL_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint = std::env::var("CODEBOX_SURREAL_ENDPOINT")
            .map_err(|_| "CODEBOX_SURREAL_ENDPOINT not set")?;
        let username = std::env::var("CODEBOX_SURREAL_USERNAME")
            .map_err(|_| "CODEBOX_SURREAL_USERNAME not set")?;
        let password = std::env::var("CODEBOX_SURREAL_PASSWORD")
            .map_err(|_| "CODEBOX_SURREAL_PASSWORD not set")?;
        let namespace =
            std::env::var("CODEBOX_SURREAL_NAMESPACE").unwrap_or_else(|_| "codebox".to_string());
        let database =
            std::env::var("CODEBOX_SURREAL_DATABASE").unwrap_or_else(|_| "sandbox".to_string());
        let is_root = std::env::var("CODEBOX_SURREAL_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// SurrealDB connection handle shared by every sandbox instance
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

#[derive(Deserialize)]
struct KeyRow {
    key: String,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");

        let db = surrealdb::engine::any::connect("mem://")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        db.use_ns("codebox")
            .use_db("sandbox")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB connected and schema initialized");
        Ok(handle)
    }

    /// Connect to a remote SurrealDB instance shared across sandbox hosts
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_remote(config: RemoteConfig) -> Result<Self> {
        info!("Connecting to remote SurrealDB (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("Remote SurrealDB connected and schema initialized");
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If CODEBOX_SURREAL_ENDPOINT is set, connects with credentials.
    /// If CODEBOX_SURREAL_URL is set, connects to that URL anonymously.
    /// Otherwise, falls back to in-memory.
    #[instrument(skip_all)]
    pub async fn setup_from_env() -> Result<Self> {
        if let Ok(config) = RemoteConfig::from_env() {
            info!("Remote config found, connecting to SurrealDB");
            return Self::setup_remote(config).await;
        }

        if let Ok(url) = std::env::var("CODEBOX_SURREAL_URL") {
            info!("CODEBOX_SURREAL_URL found, connecting to {}", url);
            let db = surrealdb::engine::any::connect(&url)
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;

            db.use_ns("codebox")
                .use_db("sandbox")
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;

            let handle = SurrealHandle { db };
            handle.init_schema().await?;
            return Ok(handle);
        }

        info!("No remote config found, using in-memory database");
        Self::setup_db().await
    }

    async fn init_schema(&self) -> Result<()> {
        debug!("Initializing codebox schema");

        let schema = r#"
            -- Shared execution-result cache (L2)
            DEFINE TABLE cache_entries SCHEMAFULL;
            DEFINE FIELD key ON cache_entries TYPE string;
            DEFINE FIELD value_json ON cache_entries TYPE string;
            DEFINE FIELD inserted_at_ms ON cache_entries TYPE int;
            DEFINE FIELD expires_at_ms ON cache_entries TYPE int;
            DEFINE INDEX idx_cache_key ON cache_entries FIELDS key UNIQUE;
            DEFINE INDEX idx_cache_expiry ON cache_entries FIELDS expires_at_ms;

            -- Append-only audit trail
            DEFINE TABLE audit_events SCHEMAFULL;
            DEFINE FIELD sequence ON audit_events TYPE int;
            DEFINE FIELD event_type ON audit_events TYPE string;
            DEFINE FIELD actor ON audit_events TYPE string;
            DEFINE FIELD action ON audit_events TYPE string;
            DEFINE FIELD result ON audit_events TYPE string;
            DEFINE FIELD timestamp ON audit_events TYPE string;
            DEFINE FIELD details_json ON audit_events TYPE string;
            DEFINE FIELD prev_hash ON audit_events TYPE string;
            DEFINE FIELD hash ON audit_events TYPE string;
            DEFINE INDEX idx_audit_sequence ON audit_events FIELDS sequence;
        "#;

        self.db
            .query(schema)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        debug!("Schema initialized successfully");
        Ok(())
    }

    // ========== Cache Operations ==========

    /// Store a cache row, replacing any previous row with the same key
    #[instrument(skip(self, record), fields(key = %record.key))]
    pub async fn put_cache_entry(&self, record: &CacheRecord) -> Result<()> {
        debug!("Saving cache entry");

        self.delete_cache_entry(&record.key).await?;

        let record_owned = record.clone();
        let created: Option<CacheRecord> = self
            .db
            .create("cache_entries")
            .content(record_owned)
            .await?;

        created
            .map(|_| ())
            .ok_or_else(|| StateError::Transaction("Failed to create cache entry".to_string()))
    }

    /// Fetch a live cache row; expired rows are purged and reported as absent
    #[instrument(skip(self))]
    pub async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheRecord>> {
        let key_owned = key.to_string();

        let mut result = self
            .db
            .query("SELECT * FROM cache_entries WHERE key = $key")
            .bind(("key", key_owned))
            .await?;

        let rows: Vec<CacheRecord> = result.take(0)?;
        match rows.into_iter().next() {
            Some(record) if record.is_expired() => {
                debug!("Cache entry expired, purging");
                self.delete_cache_entry(key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Delete a cache row. Returns whether a row existed.
    #[instrument(skip(self))]
    pub async fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        let key_owned = key.to_string();

        let mut result = self
            .db
            .query("DELETE cache_entries WHERE key = $key RETURN BEFORE")
            .bind(("key", key_owned))
            .await?;

        let removed: Vec<CacheRecord> = result.take(0)?;
        Ok(!removed.is_empty())
    }

    /// List every cached key (expired rows included until purged)
    #[instrument(skip(self))]
    pub async fn list_cache_keys(&self) -> Result<Vec<String>> {
        let mut result = self.db.query("SELECT key FROM cache_entries").await?;
        let rows: Vec<KeyRow> = result.take(0)?;
        Ok(rows.into_iter().map(|r| r.key).collect())
    }

    /// Remove every row whose expiry has passed. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn purge_expired_cache_entries(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();

        let mut result = self
            .db
            .query("DELETE cache_entries WHERE expires_at_ms <= $now RETURN BEFORE")
            .bind(("now", now))
            .await?;

        let removed: Vec<CacheRecord> = result.take(0)?;
        if !removed.is_empty() {
            info!("Purged {} expired cache entries", removed.len());
        }
        Ok(removed.len())
    }

    // ========== Audit Operations ==========

    /// Append an audit event
    #[instrument(skip(self, record), fields(sequence = record.sequence, event_type = %record.event_type))]
    pub async fn append_audit_event(&self, record: &AuditRecord) -> Result<()> {
        let record_owned = record.clone();
        let created: Option<AuditRecord> = self
            .db
            .create("audit_events")
            .content(record_owned)
            .await?;

        created
            .map(|_| ())
            .ok_or_else(|| StateError::Transaction("Failed to append audit event".to_string()))
    }

    /// All audit events in append order
    #[instrument(skip(self))]
    pub async fn list_audit_events(&self) -> Result<Vec<AuditRecord>> {
        let mut result = self
            .db
            .query("SELECT * FROM audit_events ORDER BY sequence ASC")
            .await?;
        let rows: Vec<AuditRecord> = result.take(0)?;
        Ok(rows)
    }

    /// The most recently appended audit event, if any
    #[instrument(skip(self))]
    pub async fn last_audit_event(&self) -> Result<Option<AuditRecord>> {
        let mut result = self
            .db
            .query("SELECT * FROM audit_events ORDER BY sequence DESC LIMIT 1")
            .await?;
        let rows: Vec<AuditRecord> = result.take(0)?;
        Ok(rows.into_iter().next())
    }
}
