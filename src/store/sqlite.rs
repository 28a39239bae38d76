//! SQLite-backed chat store.
//!
//! Chats and personas persist as a few queryable meta columns plus a
//! `json_data` document column; the document is authoritative, the columns
//! exist for ordering and listing without a full parse.

use std::path::Path;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::{Chat, ChatStore};
use crate::config::Settings;
use crate::error::ChatError;
use crate::persona::{Persona, DEFAULT_PERSONA_ID, NARRATOR_PERSONA_ID};
use crate::utils::{new_id, now_millis};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chats (
    id            TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    last_modified INTEGER,
    json_data     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS personas (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    json_data  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    id        INTEGER PRIMARY KEY CHECK (id = 1),
    json_data TEXT NOT NULL
);
"#;

fn init_pragmas(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        PRAGMA foreign_keys=ON;
        "#,
    )
}

pub struct SqliteChatStore {
    pool: DbPool,
}

impl SqliteChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(init_pragmas);
        let pool = Pool::builder().max_size(10).build(manager)?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// Single-connection in-memory database; pooled in-memory connections
    /// would each see their own empty database.
    pub fn open_in_memory() -> Result<Self, ChatError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<DbConnection, ChatError> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

fn chat_from_row(id: String, json_data: String) -> Result<Chat, ChatError> {
    let mut chat: Chat = serde_json::from_str(&json_data)?;
    chat.id = id;
    Ok(chat)
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_chat(&self, mut chat: Chat) -> Result<String, ChatError> {
        chat.validate()?;
        if chat.id.is_empty() {
            chat.id = new_id();
        }
        if chat.created_at == 0 {
            chat.created_at = now_millis();
        }
        chat.last_modified = Some(now_millis());

        let json_data = serde_json::to_string(&chat)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chats (id, title, created_at, last_modified, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat.id,
                chat.title,
                chat.created_at as i64,
                chat.last_modified.map(|v| v as i64),
                json_data
            ],
        )?;
        Ok(chat.id)
    }

    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, ChatError> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT id, json_data FROM chats WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, json_data)) => Ok(Some(chat_from_row(id, json_data)?)),
            None => Ok(None),
        }
    }

    async fn put_chat(&self, chat: &Chat) -> Result<(), ChatError> {
        if chat.id.is_empty() {
            return Err(ChatError::Store(
                "put_chat requires a store-assigned id".to_string(),
            ));
        }
        chat.validate()?;

        let mut stamped = chat.clone();
        stamped.last_modified = Some(now_millis());
        let json_data = serde_json::to_string(&stamped)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chats (id, title, created_at, last_modified, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               title=excluded.title,
               last_modified=excluded.last_modified,
               json_data=excluded.json_data",
            params![
                stamped.id,
                stamped.title,
                stamped.created_at as i64,
                stamped.last_modified.map(|v| v as i64),
                json_data
            ],
        )?;
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<Chat>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, json_data FROM chats
             ORDER BY COALESCE(last_modified, created_at) DESC, created_at DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, json_data) = row?;
            match chat_from_row(id.clone(), json_data) {
                Ok(chat) => out.push(chat),
                // One corrupt document must not take the whole list down.
                Err(err) => warn!(target: "store", chat_id = %id, "skipping unreadable chat: {}", err),
            }
        }
        Ok(out)
    }

    async fn delete_chat(&self, id: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn put_persona(&self, persona: &Persona) -> Result<(), ChatError> {
        if persona.id == DEFAULT_PERSONA_ID || persona.id == NARRATOR_PERSONA_ID {
            return Err(ChatError::Config(format!(
                "persona id {} is reserved",
                persona.id
            )));
        }
        let mut stored = persona.clone();
        if stored.id.is_empty() {
            stored.id = new_id();
        }
        let now = now_millis();
        stored.updated_at = now;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing_created: Option<i64> = tx
            .query_row(
                "SELECT created_at FROM personas WHERE id = ?1",
                params![stored.id],
                |r| r.get(0),
            )
            .optional()?;
        stored.created_at = existing_created.map(|v| v as u64).unwrap_or(now);

        let json_data = serde_json::to_string(&stored)?;
        tx.execute(
            "INSERT INTO personas (id, name, created_at, updated_at, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               name=excluded.name,
               updated_at=excluded.updated_at,
               json_data=excluded.json_data",
            params![
                stored.id,
                stored.name,
                stored.created_at as i64,
                stored.updated_at as i64,
                json_data
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, ChatError> {
        let conn = self.conn()?;
        let json_data: Option<String> = conn
            .query_row(
                "SELECT json_data FROM personas WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        match json_data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, ChatError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT json_data FROM personas ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn delete_persona(&self, id: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM personas WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn read_settings(&self) -> Result<Settings, ChatError> {
        let conn = self.conn()?;
        let json_data: Option<String> = conn
            .query_row("SELECT json_data FROM settings WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        match json_data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => {
                let defaults = Settings::default();
                conn.execute(
                    "INSERT INTO settings (id, json_data) VALUES (1, ?1)",
                    params![serde_json::to_string(&defaults)?],
                )?;
                Ok(defaults)
            }
        }
    }

    async fn write_settings(&self, settings: &Settings) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (id, json_data) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET json_data=excluded.json_data",
            params![serde_json::to_string(settings)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Message;

    fn test_persona(id: &str, name: &str) -> Persona {
        Persona {
            id: id.to_string(),
            name: name.to_string(),
            ..crate::persona::default_persona()
        }
    }

    #[tokio::test]
    async fn chat_round_trip_assigns_id_and_stamps() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let mut chat = Chat::new("First chat");
        chat.messages.push(Message::user("hello"));

        let id = store.create_chat(chat).await.unwrap();
        assert!(!id.is_empty());

        let loaded = store.get_chat(&id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "First chat");
        assert_eq!(loaded.messages.len(), 1);
        assert!(loaded.last_modified.is_some());
    }

    #[tokio::test]
    async fn get_missing_chat_is_none() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        assert!(store.get_chat("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_most_recently_modified() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let a = store.create_chat(Chat::new("a")).await.unwrap();
        let b = store.create_chat(Chat::new("b")).await.unwrap();

        // Touch "a" so it becomes the most recent.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut chat_a = store.get_chat(&a).await.unwrap().unwrap();
        chat_a.messages.push(Message::user("bump"));
        store.put_chat(&chat_a).await.unwrap();

        let listed = store.list_chats().await.unwrap();
        assert_eq!(listed[0].id, a);
        assert_eq!(listed[1].id, b);
    }

    #[tokio::test]
    async fn delete_chat_is_all_or_nothing() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let id = store.create_chat(Chat::new("gone")).await.unwrap();
        store.delete_chat(&id).await.unwrap();
        assert!(store.get_chat(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persona_upsert_preserves_created_at() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let mut p = test_persona("p1", "Ada");
        store.put_persona(&p).await.unwrap();
        let first = store.get_persona("p1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        p.name = "Ada Prime".to_string();
        store.put_persona(&p).await.unwrap();
        let second = store.get_persona("p1").await.unwrap().unwrap();

        assert_eq!(second.name, "Ada Prime");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn reserved_persona_ids_are_rejected() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let p = test_persona(DEFAULT_PERSONA_ID, "Imposter");
        assert!(matches!(
            store.put_persona(&p).await,
            Err(ChatError::Config(_))
        ));
    }

    #[tokio::test]
    async fn settings_default_on_first_read_then_persist() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        let first = store.read_settings().await.unwrap();
        assert!(!first.auto_progress);

        let mut updated = first.clone();
        updated.auto_progress = true;
        updated.api_key = Some("k".to_string());
        store.write_settings(&updated).await.unwrap();

        let second = store.read_settings().await.unwrap();
        assert!(second.auto_progress);
        assert_eq!(second.api_key.as_deref(), Some("k"));
    }
}
