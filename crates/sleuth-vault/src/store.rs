use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use sleuth_core::config::VaultConfig;
use sleuth_core::error::{Result, SleuthError};
use sleuth_core::types::{OwnerId, SecretMeta};

use crate::crypto::{MasterKey, SealedSecret};

/// Per-owner encrypted credential store.
///
/// One row per `(owner_id, name)`; no implicit versioning. Ciphertext,
/// nonce, and salt never leave this type's boundary; callers only ever
/// see plaintexts or `SecretMeta`.
pub struct SecretVault {
    conn: Mutex<Connection>,
    master: MasterKey,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS secrets (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        name TEXT NOT NULL,
        ciphertext BLOB NOT NULL,
        nonce BLOB NOT NULL,
        salt BLOB NOT NULL,
        key_version TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(owner_id, name)
    );";

impl SecretVault {
    /// Open or create the vault database. The master key is decoded and
    /// validated here, so a bad key is a fatal configuration error at
    /// first use.
    pub fn open(config: &VaultConfig, path: &Path) -> Result<Self> {
        let master = MasterKey::from_config(config)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SleuthError::Database(format!("Failed to create vault directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SleuthError::Database(e.to_string()))?;

        debug!(path = %path.display(), key_version = master.version(), "Secret vault opened");
        Ok(Self {
            conn: Mutex::new(conn),
            master,
        })
    }

    /// Open an in-memory vault (for testing).
    pub fn in_memory(config: &VaultConfig) -> Result<Self> {
        let master = MasterKey::from_config(config)?;
        let conn =
            Connection::open_in_memory().map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            master,
        })
    }

    /// Store a secret, overwriting any existing `(owner, name)` record.
    pub fn set_secret(&self, owner: &OwnerId, name: &str, plaintext: &str) -> Result<SecretMeta> {
        let sealed = self.master.seal(owner, plaintext.as_bytes())?;
        let conn = self.lock()?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO secrets (id, owner_id, name, ciphertext, nonce, salt, key_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(owner_id, name) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                nonce = excluded.nonce,
                salt = excluded.salt,
                key_version = excluded.key_version",
            params![
                id,
                owner.0,
                name,
                sealed.ciphertext,
                sealed.nonce,
                sealed.salt,
                self.master.version(),
                now,
            ],
        )
        .map_err(|e| SleuthError::Database(e.to_string()))?;

        let meta = conn
            .query_row(
                "SELECT id, name, owner_id, created_at FROM secrets
                 WHERE owner_id = ?1 AND name = ?2",
                params![owner.0, name],
                row_to_meta,
            )
            .map_err(|e| SleuthError::Database(e.to_string()))?;

        debug!(owner = %owner, name, "Secret stored");
        Ok(meta)
    }

    /// Look a secret up by reference, tried first as a record id, then as
    /// a record name, both scoped to `owner`. A miss on both is `None`,
    /// not an error; a decryption failure is an error, not a miss.
    pub fn get_secret(&self, owner: &OwnerId, reference: &str) -> Result<Option<String>> {
        let sealed = {
            let conn = self.lock()?;
            let by_id = conn
                .query_row(
                    "SELECT ciphertext, nonce, salt FROM secrets
                     WHERE owner_id = ?1 AND id = ?2",
                    params![owner.0, reference],
                    row_to_sealed,
                )
                .optional()
                .map_err(|e| SleuthError::Database(e.to_string()))?;

            match by_id {
                Some(sealed) => Some(sealed),
                None => conn
                    .query_row(
                        "SELECT ciphertext, nonce, salt FROM secrets
                         WHERE owner_id = ?1 AND name = ?2",
                        params![owner.0, reference],
                        row_to_sealed,
                    )
                    .optional()
                    .map_err(|e| SleuthError::Database(e.to_string()))?,
            }
        };

        let Some(sealed) = sealed else {
            return Ok(None);
        };

        let plaintext = self.master.open(owner, &sealed)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| SleuthError::SecretAuth("decrypted secret is not UTF-8".into()))?;
        Ok(Some(text))
    }

    /// List secret metadata for one owner.
    pub fn list_secrets(&self, owner: &OwnerId) -> Result<Vec<SecretMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, owner_id, created_at FROM secrets
                 WHERE owner_id = ?1 ORDER BY name",
            )
            .map_err(|e| SleuthError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![owner.0], row_to_meta)
            .map_err(|e| SleuthError::Database(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| SleuthError::Database(e.to_string()))?);
        }
        Ok(out)
    }

    /// Delete a secret by name. Returns whether a record was removed.
    pub fn delete_secret(&self, owner: &OwnerId, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM secrets WHERE owner_id = ?1 AND name = ?2",
                params![owner.0, name],
            )
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        Ok(affected > 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SleuthError::Database(e.to_string()))
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecretMeta> {
    let created: String = row.get(3)?;
    Ok(SecretMeta {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: OwnerId(row.get(2)?),
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_sealed(row: &rusqlite::Row<'_>) -> rusqlite::Result<SealedSecret> {
    Ok(SealedSecret {
        ciphertext: row.get(0)?,
        nonce: row.get(1)?,
        salt: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn vault() -> SecretVault {
        let config = VaultConfig {
            master_key: Some(base64::engine::general_purpose::STANDARD.encode([3u8; 32])),
            key_version: "V1".into(),
        };
        SecretVault::in_memory(&config).unwrap()
    }

    #[test]
    fn set_and_get_by_name() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");

        vault.set_secret(&owner, "hibp_api_key", "k-123").unwrap();
        let got = vault.get_secret(&owner, "hibp_api_key").unwrap();
        assert_eq!(got.as_deref(), Some("k-123"));
    }

    #[test]
    fn get_by_id_takes_precedence() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");

        let meta = vault.set_secret(&owner, "api_key", "by-name").unwrap();
        let got = vault.get_secret(&owner, &meta.id).unwrap();
        assert_eq!(got.as_deref(), Some("by-name"));
    }

    #[test]
    fn miss_is_none_not_error() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");
        assert!(vault.get_secret(&owner, "nope").unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_single_record() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");

        let first = vault.set_secret(&owner, "key", "one").unwrap();
        let second = vault.set_secret(&owner, "key", "two").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(vault.list_secrets(&owner).unwrap().len(), 1);
        assert_eq!(
            vault.get_secret(&owner, "key").unwrap().as_deref(),
            Some("two")
        );
    }

    #[test]
    fn owners_are_isolated_on_name_collision() {
        let vault = vault();
        let alice = OwnerId::from_string("alice");
        let bob = OwnerId::from_string("bob");

        vault.set_secret(&alice, "api_key", "alice-key").unwrap();
        vault.set_secret(&bob, "api_key", "bob-key").unwrap();

        assert_eq!(
            vault.get_secret(&alice, "api_key").unwrap().as_deref(),
            Some("alice-key")
        );
        assert_eq!(
            vault.get_secret(&bob, "api_key").unwrap().as_deref(),
            Some("bob-key")
        );
    }

    #[test]
    fn foreign_owner_reference_is_a_miss() {
        let vault = vault();
        let alice = OwnerId::from_string("alice");
        let bob = OwnerId::from_string("bob");

        let meta = vault.set_secret(&alice, "api_key", "alice-key").unwrap();
        // Bob referencing Alice's record id resolves to nothing
        assert!(vault.get_secret(&bob, &meta.id).unwrap().is_none());
    }

    #[test]
    fn delete_removes_record() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");

        vault.set_secret(&owner, "key", "v").unwrap();
        assert!(vault.delete_secret(&owner, "key").unwrap());
        assert!(!vault.delete_secret(&owner, "key").unwrap());
        assert!(vault.get_secret(&owner, "key").unwrap().is_none());
    }

    #[test]
    fn meta_never_exposes_cipher_material() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");
        let meta = vault.set_secret(&owner, "key", "v").unwrap();

        let json = serde_json::to_value(&meta).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys.len(), 4);
        assert!(json.get("ciphertext").is_none());
        assert!(json.get("salt").is_none());
        assert!(json.get("nonce").is_none());
    }
}
