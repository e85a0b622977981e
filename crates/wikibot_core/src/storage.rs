use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Durable string store without expiry.
///
/// `apply` writes and deletes every listed key in one atomic step.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn apply(&mut self, set: &[(&str, &str)], forget: &[&str]) -> Result<()>;

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(&[(key, value)], &[])
    }

    fn forget(&mut self, key: &str) -> Result<()> {
        self.apply(&[], &[key])
    }
}

pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let parent = db_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory sqlite store")?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize key/value schema")?;
        Ok(Self { connection })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read store key {key}"))
    }

    fn apply(&mut self, set: &[(&str, &str)], forget: &[&str]) -> Result<()> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to begin store transaction")?;
        for (key, value) in set {
            transaction
                .execute(
                    "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .with_context(|| format!("failed to set store key {key}"))?;
        }
        for key in forget {
            transaction
                .execute("DELETE FROM kv_store WHERE key = ?1", [key])
                .with_context(|| format!("failed to forget store key {key}"))?;
        }
        transaction
            .commit()
            .context("failed to commit store transaction")
    }
}

/// Pagination cursor pair returned by `list=allpages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub continue_token: Option<String>,
    pub ap_continue: Option<String>,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.continue_token.is_none() && self.ap_continue.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKeys {
    pub continue_key: String,
    pub ap_continue_key: String,
}

impl CheckpointKeys {
    pub fn for_language(language: &str) -> Self {
        Self {
            continue_key: format!("interwiki.{language}.continue"),
            ap_continue_key: format!("interwiki.{language}.apcontinue"),
        }
    }
}

pub fn load_checkpoint<S: KeyValueStore + ?Sized>(
    store: &S,
    keys: &CheckpointKeys,
) -> Result<Option<Checkpoint>> {
    let checkpoint = Checkpoint {
        continue_token: store.get(&keys.continue_key)?,
        ap_continue: store.get(&keys.ap_continue_key)?,
    };
    Ok((!checkpoint.is_empty()).then_some(checkpoint))
}

pub fn save_checkpoint<S: KeyValueStore + ?Sized>(
    store: &mut S,
    keys: &CheckpointKeys,
    checkpoint: &Checkpoint,
) -> Result<()> {
    let mut entries = Vec::with_capacity(2);
    let mut stale = Vec::with_capacity(2);
    match &checkpoint.continue_token {
        Some(value) => entries.push((keys.continue_key.as_str(), value.as_str())),
        None => stale.push(keys.continue_key.as_str()),
    }
    match &checkpoint.ap_continue {
        Some(value) => entries.push((keys.ap_continue_key.as_str(), value.as_str())),
        None => stale.push(keys.ap_continue_key.as_str()),
    }
    store.apply(&entries, &stale)
}

pub fn clear_checkpoint<S: KeyValueStore + ?Sized>(
    store: &mut S,
    keys: &CheckpointKeys,
) -> Result<()> {
    store.apply(
        &[],
        &[keys.continue_key.as_str(), keys.ap_continue_key.as_str()],
    )
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn get_set_forget_round_trip_in_memory() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        assert_eq!(store.get("missing").expect("get"), None);

        store.set("interwiki.en.continue", "-||").expect("set");
        store.set("interwiki.en.continue", "-||2").expect("overwrite");
        assert_eq!(
            store.get("interwiki.en.continue").expect("get").as_deref(),
            Some("-||2")
        );

        store.forget("interwiki.en.continue").expect("forget");
        assert_eq!(store.get("interwiki.en.continue").expect("get"), None);
        store.forget("never-set").expect("forget unknown key");
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("data").join("wikibot.db");
        let keys = CheckpointKeys::for_language("en");
        let checkpoint = Checkpoint {
            continue_token: Some("-||".to_string()),
            ap_continue: Some("Katze".to_string()),
        };

        {
            let mut store = SqliteStore::open(&db_path).expect("open");
            assert_eq!(load_checkpoint(&store, &keys).expect("load"), None);
            save_checkpoint(&mut store, &keys, &checkpoint).expect("save");
        }

        let mut store = SqliteStore::open(&db_path).expect("reopen");
        assert_eq!(
            load_checkpoint(&store, &keys).expect("load"),
            Some(checkpoint)
        );

        clear_checkpoint(&mut store, &keys).expect("clear");
        assert_eq!(load_checkpoint(&store, &keys).expect("load"), None);
        assert_eq!(store.get(&keys.continue_key).expect("get"), None);
        assert_eq!(store.get(&keys.ap_continue_key).expect("get"), None);
    }

    #[test]
    fn checkpoint_keys_are_scoped_per_language() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        let en = CheckpointKeys::for_language("en");
        let fr = CheckpointKeys::for_language("fr");
        save_checkpoint(
            &mut store,
            &en,
            &Checkpoint {
                continue_token: Some("-||".to_string()),
                ap_continue: Some("B".to_string()),
            },
        )
        .expect("save");
        assert_eq!(load_checkpoint(&store, &fr).expect("load"), None);
        assert_eq!(en.ap_continue_key, "interwiki.en.apcontinue");
    }

    #[test]
    fn saving_partial_checkpoint_drops_stale_half() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        let keys = CheckpointKeys::for_language("en");
        save_checkpoint(
            &mut store,
            &keys,
            &Checkpoint {
                continue_token: Some("-||".to_string()),
                ap_continue: Some("B".to_string()),
            },
        )
        .expect("save full");
        save_checkpoint(
            &mut store,
            &keys,
            &Checkpoint {
                continue_token: None,
                ap_continue: Some("C".to_string()),
            },
        )
        .expect("save partial");
        assert_eq!(
            load_checkpoint(&store, &keys).expect("load"),
            Some(Checkpoint {
                continue_token: None,
                ap_continue: Some("C".to_string()),
            })
        );
    }
}
