//! C1 — the credential store: a local SQLite file with WAL journaling and a busy
//! timeout, holding the `auth_credentials` and `cache` tables described in spec §4.1.
//!
//! Every operation here is best-effort by design (spec §7): reads that fail return
//! "absent", writes that fail are logged and swallowed, because the selector (C6)
//! treats itself — not the store — as the source of truth between reloads.

use crate::credential::{ApiKeyCredential, Credential, CredentialType, OAuthCredential, StoredCredential};
use crate::error::AuthBrokerError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct CredentialStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl CredentialStore {
    /// Open (creating if absent) the store at `path`, applying WAL mode, a 5s busy
    /// timeout, and the forward-only `disabled` column migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthBrokerError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthBrokerError::Store(format!("create dir {parent:?}: {e}")))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let conn = Connection::open(&path)
            .map_err(|e| AuthBrokerError::Store(format!("open {path:?}: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AuthBrokerError::Store(format!("journal_mode: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AuthBrokerError::Store(format!("busy_timeout: {e}")))?;

        Self::migrate(&conn).map_err(|e| AuthBrokerError::Store(format!("migrate: {e}")))?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth_credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                data TEXT NOT NULL,
                disabled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_auth_credentials_provider ON auth_credentials(provider);

            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);",
        )?;

        // Forward-only migration: older databases predate the `disabled` column.
        let has_disabled: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('auth_credentials') WHERE name = 'disabled'")?
            .exists([])?;
        if !has_disabled {
            conn.execute("ALTER TABLE auth_credentials ADD COLUMN disabled INTEGER NOT NULL DEFAULT 0", [])?;
        }

        Ok(())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn serialize(credential: &Credential) -> (CredentialType, serde_json::Value) {
        match credential {
            Credential::ApiKey(c) => (CredentialType::ApiKey, serde_json::json!({ "key": c.key })),
            Credential::OAuth(c) => (
                CredentialType::OAuth,
                serde_json::to_value(c).unwrap_or(serde_json::Value::Null),
            ),
        }
    }

    fn deserialize(credential_type: &str, data: &serde_json::Value) -> Option<Credential> {
        match credential_type {
            "api_key" => {
                let key = data.get("key")?.as_str()?.to_string();
                Some(Credential::ApiKey(ApiKeyCredential { key }))
            }
            "oauth" => {
                let c: OAuthCredential = serde_json::from_value(data.clone()).ok()?;
                Some(Credential::OAuth(c))
            }
            _ => None,
        }
    }

    fn row_to_stored(
        id: i64,
        provider: String,
        credential_type: String,
        data: String,
        created_at: i64,
        updated_at: i64,
    ) -> Option<StoredCredential> {
        let value: serde_json::Value = serde_json::from_str(&data).ok()?;
        let credential = Self::deserialize(&credential_type, &value)?;
        Some(StoredCredential { id, provider, credential, created_at, updated_at })
    }

    /// Rows ordered by id ascending, excluding disabled rows. Malformed rows are
    /// silently dropped (spec §4.1). Any read failure yields an empty list.
    pub async fn list_auth_credentials(&self, provider: Option<&str>) -> Vec<StoredCredential> {
        let conn = self.conn.lock().await;
        let result = (|| -> rusqlite::Result<Vec<StoredCredential>> {
            let mut out = Vec::new();
            let mut push_rows = |mut stmt: rusqlite::Statement, args: &[&dyn rusqlite::ToSql]| -> rusqlite::Result<()> {
                let mut rows = stmt.query(args)?;
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get(0)?;
                    let provider: String = row.get(1)?;
                    let credential_type: String = row.get(2)?;
                    let data: String = row.get(3)?;
                    let created_at: i64 = row.get(4)?;
                    let updated_at: i64 = row.get(5)?;
                    if let Some(sc) = Self::row_to_stored(id, provider, credential_type, data, created_at, updated_at) {
                        out.push(sc);
                    }
                }
                Ok(())
            };

            if let Some(p) = provider {
                let stmt = conn.prepare(
                    "SELECT id, provider, credential_type, data, created_at, updated_at
                     FROM auth_credentials WHERE provider = ?1 AND disabled = 0 ORDER BY id ASC",
                )?;
                push_rows(stmt, &[&p])?;
            } else {
                let stmt = conn.prepare(
                    "SELECT id, provider, credential_type, data, created_at, updated_at
                     FROM auth_credentials WHERE disabled = 0 ORDER BY id ASC",
                )?;
                push_rows(stmt, &[])?;
            }
            Ok(out)
        })();

        match result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!(error = %e, "listAuthCredentials failed, treating as empty");
                Vec::new()
            }
        }
    }

    /// Atomically soft-disables all existing rows for `provider` and inserts the new
    /// set, returning the new row ids in the same order as `credentials`.
    pub async fn replace_for_provider(&self, provider: &str, credentials: &[Credential]) -> Vec<i64> {
        let mut conn = self.conn.lock().await;
        let now = Self::now_ms();
        let result = (|| -> rusqlite::Result<Vec<i64>> {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE auth_credentials SET disabled = 1, updated_at = ?1 WHERE provider = ?2 AND disabled = 0",
                params![now, provider],
            )?;

            let mut ids = Vec::with_capacity(credentials.len());
            for credential in credentials {
                let (kind, data) = Self::serialize(credential);
                tx.execute(
                    "INSERT INTO auth_credentials (provider, credential_type, data, disabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                    params![provider, kind.as_str(), data.to_string(), now],
                )?;
                ids.push(tx.last_insert_rowid());
            }

            tx.commit()?;
            Ok(ids)
        })();

        match result {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, provider, "replaceForProvider failed");
                Vec::new()
            }
        }
    }

    /// Best-effort update of an existing row's type/data. Failures are swallowed;
    /// the next `reload()` from the authoritative store corrects in-memory state.
    pub async fn update_auth_credential(&self, id: i64, credential: &Credential) {
        let conn = self.conn.lock().await;
        let (kind, data) = Self::serialize(credential);
        let now = Self::now_ms();
        if let Err(e) = conn.execute(
            "UPDATE auth_credentials SET credential_type = ?1, data = ?2, updated_at = ?3 WHERE id = ?4",
            params![kind.as_str(), data.to_string(), now, id],
        ) {
            tracing::debug!(error = %e, id, "updateAuthCredential failed (best-effort)");
        }
    }

    pub async fn delete_auth_credential(&self, id: i64) {
        let conn = self.conn.lock().await;
        let now = Self::now_ms();
        if let Err(e) = conn.execute(
            "UPDATE auth_credentials SET disabled = 1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        ) {
            tracing::debug!(error = %e, id, "deleteAuthCredential failed (best-effort)");
        }
    }

    pub async fn delete_auth_credentials_for_provider(&self, provider: &str) {
        let conn = self.conn.lock().await;
        let now = Self::now_ms();
        if let Err(e) = conn.execute(
            "UPDATE auth_credentials SET disabled = 1, updated_at = ?1 WHERE provider = ?2",
            params![now, provider],
        ) {
            tracing::debug!(error = %e, provider, "deleteAuthCredentialsForProvider failed (best-effort)");
        }
    }

    pub async fn get_cache(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        let result: rusqlite::Result<Option<String>> = conn
            .query_row(
                "SELECT value FROM cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional();
        match result {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, key, "getCache failed (best-effort)");
                None
            }
        }
    }

    pub async fn set_cache(&self, key: &str, value: &str, expires_at_secs: i64) {
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute(
            "INSERT INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at_secs],
        ) {
            tracing::debug!(error = %e, key, "setCache failed (best-effort)");
        }
    }

    pub async fn clean_expired_cache(&self) {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = conn.execute("DELETE FROM cache WHERE expires_at <= ?1", params![now]) {
            tracing::debug!(error = %e, "cleanExpiredCache failed (best-effort)");
        }
    }
}

#[async_trait::async_trait]
impl crate::cache::UsageCache for CredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.get_cache(&format!("usage_cache:{key}")).await
    }

    async fn set(&self, key: &str, value: &str, expires_at_secs: i64) {
        self.set_cache(&format!("usage_cache:{key}"), value, expires_at_secs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::OAuthCredential;
    use std::collections::HashMap;

    fn tmp_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        let store = CredentialStore::open(&path).unwrap();
        (dir, store)
    }

    fn api_key(k: &str) -> Credential {
        Credential::ApiKey(ApiKeyCredential { key: k.into() })
    }

    #[tokio::test]
    async fn replace_then_list_round_trips_order() {
        let (_dir, store) = tmp_store();
        let ids = store
            .replace_for_provider("openai", &[api_key("a"), api_key("b")])
            .await;
        assert_eq!(ids.len(), 2);

        let rows = store.list_auth_credentials(Some("openai")).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, ids[0]);
        assert_eq!(rows[1].id, ids[1]);
    }

    #[tokio::test]
    async fn replace_soft_disables_prior_generation() {
        let (_dir, store) = tmp_store();
        store.replace_for_provider("openai", &[api_key("a")]).await;
        store.replace_for_provider("openai", &[api_key("b")]).await;

        let rows = store.list_auth_credentials(Some("openai")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credential.as_api_key().unwrap().key, "b");
    }

    #[tokio::test]
    async fn update_preserves_unknown_oauth_fields() {
        let (_dir, store) = tmp_store();
        let mut extra = HashMap::new();
        extra.insert("weird_field".to_string(), serde_json::json!(42));
        let cred = Credential::OAuth(OAuthCredential {
            access: "a1".into(),
            refresh: "r1".into(),
            expires: 1000,
            account_id: None,
            email: None,
            project_id: None,
            enterprise_url: None,
            extra,
        });
        let ids = store.replace_for_provider("anthropic", &[cred]).await;

        let rows = store.list_auth_credentials(Some("anthropic")).await;
        let oauth = rows[0].credential.as_oauth().unwrap();
        assert_eq!(oauth.extra.get("weird_field"), Some(&serde_json::json!(42)));

        // Round-trip an update too.
        let mut updated = oauth.clone();
        updated.access = "a2".into();
        store.update_auth_credential(ids[0], &Credential::OAuth(updated)).await;
        let rows2 = store.list_auth_credentials(Some("anthropic")).await;
        assert_eq!(rows2[0].credential.as_oauth().unwrap().access, "a2");
        assert_eq!(rows2[0].credential.as_oauth().unwrap().extra.get("weird_field"), Some(&serde_json::json!(42)));
    }

    #[tokio::test]
    async fn delete_soft_disables() {
        let (_dir, store) = tmp_store();
        let ids = store.replace_for_provider("openai", &[api_key("a"), api_key("b")]).await;
        store.delete_auth_credential(ids[0]).await;
        let rows = store.list_auth_credentials(Some("openai")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ids[1]);
    }

    #[tokio::test]
    async fn cache_expiry_is_respected() {
        let (_dir, store) = tmp_store();
        let now = chrono::Utc::now().timestamp();
        store.set_cache("k", "v", now + 60).await;
        assert_eq!(store.get_cache("k").await, Some("v".to_string()));

        store.set_cache("expired", "v", now - 60).await;
        assert_eq!(store.get_cache("expired").await, None);

        store.clean_expired_cache().await;
        assert_eq!(store.get_cache("expired").await, None);
    }

    #[tokio::test]
    async fn malformed_row_is_dropped_not_fatal() {
        let (_dir, store) = tmp_store();
        store.replace_for_provider("openai", &[api_key("good")]).await;
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "INSERT INTO auth_credentials (provider, credential_type, data, disabled, created_at, updated_at)
                 VALUES ('openai', 'oauth', '{\"not\": \"a credential\"}', 0, 0, 0)",
                [],
            )
            .unwrap();
        }
        let rows = store.list_auth_credentials(Some("openai")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credential.as_api_key().unwrap().key, "good");
    }
}
