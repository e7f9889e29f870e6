use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use flowchat_core::error::{FlowError, Result};
use flowchat_core::traits::{BillingSink, ChatStore, KnowledgeBase};
use flowchat_core::types::{
    BillItem, ChatId, ChatMessage, ChatRecord, QuoteItem, Role, TaskBill, TraceRecord,
};

use crate::embeddings::cosine_similarity;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chats (
        chat_id TEXT PRIMARY KEY,
        app_id TEXT NOT NULL,
        title TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        response_data TEXT NOT NULL DEFAULT '[]',
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);

    CREATE TABLE IF NOT EXISTS quotes (
        id TEXT PRIMARY KEY,
        kb_id TEXT NOT NULL,
        q TEXT NOT NULL,
        a TEXT NOT NULL,
        source TEXT NOT NULL,
        embedding BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_quotes_kb ON quotes(kb_id);

    CREATE TABLE IF NOT EXISTS bills (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id TEXT NOT NULL,
        app_name TEXT NOT NULL,
        source TEXT NOT NULL,
        total REAL NOT NULL,
        items TEXT NOT NULL,
        created_at TEXT NOT NULL
    );";

/// Chat titles are the first question, cut to this many characters.
const TITLE_CHARS: usize = 20;

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

fn to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_role(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "user" => Role::User,
        other => {
            warn!(role = other, "Unknown stored message role, reading it as user");
            Role::User
        }
    }
}

/// SQLite-backed store for transcripts, knowledge-base quotes, and bills.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Store a knowledge-base entry with its embedding. Returns the new id.
    pub fn add_quote(
        &self,
        kb_id: &str,
        q: &str,
        a: &str,
        source: &str,
        embedding: &[f32],
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock()?
            .execute(
                "INSERT INTO quotes (id, kb_id, q, a, source, embedding) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, kb_id, q, a, source, to_blob(embedding)],
            )
            .map_err(db_err)?;
        Ok(id)
    }

    /// Number of entries in a knowledge base.
    pub fn quote_count(&self, kb_id: &str) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM quotes WHERE kb_id = ?1",
                params![kb_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    /// Full transcript of a chat including traces, oldest first.
    pub fn chat_records(&self, chat_id: &ChatId) -> Result<Vec<ChatRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT role, content, response_data, timestamp FROM messages
                 WHERE chat_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![chat_id.0], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                let response_data: String = row.get(2)?;
                let ts_str: String = row.get(3)?;
                Ok((role, content, response_data, ts_str))
            })
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (role, content, response_data, ts_str) = row.map_err(db_err)?;
            let response_data: Vec<TraceRecord> = serde_json::from_str(&response_data)?;
            records.push(ChatRecord {
                message: ChatMessage {
                    role: parse_role(&role),
                    content,
                    timestamp: DateTime::parse_from_rfc3339(&ts_str)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc)),
                },
                response_data,
            });
        }
        Ok(records)
    }

    /// All bills recorded for an app, oldest first.
    pub fn bills(&self, app_id: &str) -> Result<Vec<TaskBill>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT app_name, source, total, items FROM bills
                 WHERE app_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![app_id], |row| {
                let app_name: String = row.get(0)?;
                let source: String = row.get(1)?;
                let total: f64 = row.get(2)?;
                let items: String = row.get(3)?;
                Ok((app_name, source, total, items))
            })
            .map_err(db_err)?;

        let mut bills = Vec::new();
        for row in rows {
            let (app_name, source, total, items) = row.map_err(db_err)?;
            let items: Vec<BillItem> = serde_json::from_str(&items)?;
            bills.push(TaskBill {
                app_id: app_id.to_string(),
                app_name,
                source: serde_json::from_value(serde_json::Value::String(source))?,
                total,
                items,
            });
        }
        Ok(bills)
    }
}

impl ChatStore for SqliteStore {
    fn load_history(&self, chat_id: &ChatId, limit: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let chat_id = chat_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp FROM messages
                     WHERE chat_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![chat_id, limit as i64], |row| {
                    let role: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts_str: String = row.get(2)?;
                    Ok((role, content, ts_str))
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, ts_str) = row.map_err(db_err)?;
                messages.push(ChatMessage {
                    role: parse_role(&role),
                    content,
                    timestamp: DateTime::parse_from_rfc3339(&ts_str)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc)),
                });
            }
            messages.reverse();

            Ok(messages)
        })
    }

    fn save_chat(&self, chat_id: &ChatId, app_id: &str, records: &[ChatRecord]) -> BoxFuture<'_, Result<()>> {
        let chat_id = chat_id.0.clone();
        let app_id = app_id.to_string();
        let title: String = records
            .iter()
            .find(|r| r.message.role == Role::User)
            .map(|r| r.message.content.chars().take(TITLE_CHARS).collect())
            .unwrap_or_default();
        let rows: Vec<(String, String, String, String)> = records
            .iter()
            .map(|r| {
                (
                    r.message.role.as_str().to_string(),
                    r.message.content.clone(),
                    serde_json::to_string(&r.response_data).unwrap_or_else(|_| "[]".into()),
                    r.message.timestamp.unwrap_or_else(Utc::now).to_rfc3339(),
                )
            })
            .collect();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            let now = Utc::now().to_rfc3339();

            tx.execute(
                "INSERT INTO chats (chat_id, app_id, title, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_id) DO UPDATE SET updated_at = excluded.updated_at",
                params![chat_id, app_id, title, now],
            )
            .map_err(db_err)?;

            for (role, content, response_data, timestamp) in &rows {
                tx.execute(
                    "INSERT INTO messages (chat_id, role, content, response_data, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![chat_id, role, content, response_data, timestamp],
                )
                .map_err(db_err)?;
            }

            tx.commit().map_err(db_err)?;
            debug!(chat_id = %chat_id, records = rows.len(), "Chat saved");
            Ok(())
        })
    }
}

impl KnowledgeBase for SqliteStore {
    fn search(
        &self,
        kb_ids: &[String],
        vector: &[f32],
        similarity: f32,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<QuoteItem>>> {
        let kb_ids = kb_ids.to_vec();
        let query = vector.to_vec();

        Box::pin(async move {
            if kb_ids.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }

            let conn = self.lock()?;
            let placeholders = vec!["?"; kb_ids.len()].join(",");
            let sql = format!(
                "SELECT id, kb_id, q, a, source, embedding FROM quotes WHERE kb_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;

            let rows = stmt
                .query_map(params_from_iter(kb_ids.iter()), |row| {
                    let quote = QuoteItem {
                        id: row.get(0)?,
                        kb_id: row.get(1)?,
                        q: row.get(2)?,
                        a: row.get(3)?,
                        source: row.get(4)?,
                    };
                    let blob: Vec<u8> = row.get(5)?;
                    Ok((quote, blob))
                })
                .map_err(db_err)?;

            let mut scored: Vec<(f32, QuoteItem)> = Vec::new();
            for row in rows {
                let (quote, blob) = row.map_err(db_err)?;
                let sim = cosine_similarity(&query, &from_blob(&blob));
                if sim > similarity {
                    scored.push((sim, quote));
                }
            }

            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);

            Ok(scored.into_iter().map(|(_, quote)| quote).collect())
        })
    }
}

impl BillingSink for SqliteStore {
    fn push_bill(&self, bill: TaskBill) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let items = serde_json::to_string(&bill.items)?;
            self.lock()?
                .execute(
                    "INSERT INTO bills (app_id, app_name, source, total, items, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        bill.app_id,
                        bill.app_name,
                        bill.source.as_str(),
                        bill.total,
                        items,
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::types::BillSource;

    fn record(message: ChatMessage) -> ChatRecord {
        ChatRecord {
            message,
            response_data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_history() {
        let store = SqliteStore::in_memory().unwrap();
        let chat_id = ChatId::new();

        let mut answer = record(ChatMessage::assistant("Hi there!"));
        answer.response_data = vec![TraceRecord::new("AI Chat").with_usage("gpt", 12, 0.1)];
        store
            .save_chat(&chat_id, "app1", &[record(ChatMessage::user("Hello")), answer])
            .await
            .unwrap();
        store
            .save_chat(
                &chat_id,
                "app1",
                &[
                    record(ChatMessage::user("Again")),
                    record(ChatMessage::assistant("Sure")),
                ],
            )
            .await
            .unwrap();

        let history = store.load_history(&chat_id, 3).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi there!", "Again", "Sure"]);

        let records = store.chat_records(&chat_id).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].response_data[0].tokens, 12);
        assert_eq!(records[1].message.role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_unknown_stored_role_read_as_user() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO messages (chat_id, role, content, timestamp) VALUES ('c1', 'tool', 'result', 'bad')",
                [],
            )
            .unwrap();

        let history = store.load_history(&ChatId::from_string("c1"), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "result");
        assert!(history[0].timestamp.is_none());
        assert_eq!(parse_role("system"), Role::System);
    }

    #[tokio::test]
    async fn test_unknown_chat_is_empty() {
        let store = SqliteStore::in_memory().unwrap();
        let history = store.load_history(&ChatId::from_string("nope"), 10).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_knowledge_base_search() {
        let store = SqliteStore::in_memory().unwrap();
        store.add_quote("kb1", "close", "a1", "", &[1.0, 0.1]).unwrap();
        store.add_quote("kb1", "exact", "a2", "", &[1.0, 0.0]).unwrap();
        store.add_quote("kb1", "far", "a3", "", &[0.0, 1.0]).unwrap();
        store.add_quote("kb2", "other kb", "a4", "", &[1.0, 0.0]).unwrap();
        assert_eq!(store.quote_count("kb1").unwrap(), 3);

        let found = store
            .search(&["kb1".to_string()], &[1.0, 0.0], 0.8, 5)
            .await
            .unwrap();
        let qs: Vec<_> = found.iter().map(|q| q.q.as_str()).collect();
        assert_eq!(qs, vec!["exact", "close"]);

        let found = store
            .search(&["kb1".to_string(), "kb2".to_string()], &[1.0, 0.0], 0.8, 1)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].a.len(), 2);

        let found = store.search(&[], &[1.0, 0.0], 0.0, 5).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_bills_recorded() {
        let store = SqliteStore::in_memory().unwrap();
        let trace = vec![
            TraceRecord::new("KB Search").with_usage("embed", 10, 0.01),
            TraceRecord::new("AI Chat").with_usage("gpt", 100, 0.2),
        ];
        store
            .push_bill(TaskBill::from_trace("app1", "Demo", BillSource::Api, &trace))
            .await
            .unwrap();

        let bills = store.bills("app1").unwrap();
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].source, BillSource::Api);
        assert_eq!(bills[0].items.len(), 2);
        assert!((bills[0].total - 0.21).abs() < 1e-9);
        assert!(store.bills("other").unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowchat.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
