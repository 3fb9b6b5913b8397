//! SQLite persistence for users, assistants, conversations and invoices.
//!
//! One connection behind a mutex; every statement is short, so callers on the
//! async runtime hold the lock only briefly.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{domain::UserId, errors::Error, utils::unix_now, Result};

pub const PAGE_SIZE: u32 = 10;
pub const DEFAULT_VOICE: &str = "alloy";
/// Local name of the assistant every user gets on first contact.
pub const PERSONAL_ASSISTANT_NAME: &str = "Personal assistant";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id                     INTEGER PRIMARY KEY,
    first_name             TEXT    NOT NULL,
    balance                INTEGER NOT NULL DEFAULT 0,
    voice_response         INTEGER NOT NULL DEFAULT 0,
    voice                  TEXT    NOT NULL DEFAULT 'alloy',
    active_conversation_id TEXT,
    created_at             INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS assistants (
    id            TEXT    PRIMARY KEY,
    owner_id      INTEGER NOT NULL REFERENCES users(id),
    name          TEXT    NOT NULL,
    instructions  TEXT,
    serverside_id TEXT    NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assistants_owner ON assistants(owner_id);

CREATE TABLE IF NOT EXISTS assistant_guests (
    assistant_id TEXT    NOT NULL REFERENCES assistants(id),
    user_id      INTEGER NOT NULL REFERENCES users(id),
    PRIMARY KEY (assistant_id, user_id)
);

CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT    PRIMARY KEY,
    user_id      INTEGER NOT NULL REFERENCES users(id),
    assistant_id TEXT    NOT NULL REFERENCES assistants(id),
    thread_id    TEXT    NOT NULL,
    title        TEXT,
    created_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT    NOT NULL REFERENCES conversations(id),
    role            TEXT    NOT NULL,
    content         TEXT    NOT NULL,
    tokens          INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

CREATE TABLE IF NOT EXISTS invoices (
    invoice_id INTEGER PRIMARY KEY,
    user_id    INTEGER NOT NULL REFERENCES users(id),
    plan_index INTEGER NOT NULL,
    tokens     INTEGER NOT NULL,
    amount     TEXT    NOT NULL,
    asset      TEXT    NOT NULL,
    pay_url    TEXT    NOT NULL,
    status     TEXT    NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

// ============== Records ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub balance: i64,
    pub voice_response: bool,
    pub voice: String,
    pub active_conversation_id: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assistant {
    pub id: String,
    pub owner_id: UserId,
    pub name: String,
    pub instructions: Option<String>,
    pub serverside_id: String,
    pub created_at: i64,
}

impl Assistant {
    pub fn is_personal(&self) -> bool {
        self.name.eq_ignore_ascii_case(PERSONAL_ASSISTANT_NAME)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub user_id: UserId,
    pub assistant_id: String,
    pub thread_id: String,
    pub title: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tokens: i64,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvoiceStatus {
    Active,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Active => "active",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paid" => InvoiceStatus::Paid,
            "expired" => InvoiceStatus::Expired,
            _ => InvoiceStatus::Active,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_id: i64,
    pub user_id: UserId,
    pub plan_index: usize,
    pub tokens: i64,
    pub amount: String,
    pub asset: String,
    pub pay_url: String,
    pub status: InvoiceStatus,
    pub created_at: i64,
}

/// Number of pages needed to show `count` rows.
pub fn page_count(count: u64) -> u32 {
    count.div_ceil(u64::from(PAGE_SIZE)) as u32
}

/// One page of a listing plus what the pager buttons need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u32, count: u64) -> Self {
        Self {
            items,
            page: page.max(1),
            pages: page_count(count),
        }
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.pages
    }
}

fn page_offset(page: u32) -> i64 {
    i64::from(page.max(1) - 1) * i64::from(PAGE_SIZE)
}

// ============== Row mapping ==============

const USER_COLS: &str =
    "id, first_name, balance, voice_response, voice, active_conversation_id, created_at";
const ASSISTANT_COLS: &str = "id, owner_id, name, instructions, serverside_id, created_at";
const CONVERSATION_COLS: &str = "id, user_id, assistant_id, thread_id, title, created_at";
const INVOICE_COLS: &str =
    "invoice_id, user_id, plan_index, tokens, amount, asset, pay_url, status, created_at";

fn user_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        first_name: row.get(1)?,
        balance: row.get(2)?,
        voice_response: row.get::<_, i64>(3)? != 0,
        voice: row.get(4)?,
        active_conversation_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn assistant_row(row: &Row<'_>) -> rusqlite::Result<Assistant> {
    Ok(Assistant {
        id: row.get(0)?,
        owner_id: UserId(row.get(1)?),
        name: row.get(2)?,
        instructions: row.get(3)?,
        serverside_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        assistant_id: row.get(2)?,
        thread_id: row.get(3)?,
        title: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: if role == "assistant" {
            Role::Assistant
        } else {
            Role::User
        },
        content: row.get(3)?,
        tokens: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn invoice_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let status: String = row.get(7)?;
    Ok(Invoice {
        invoice_id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        plan_index: row.get::<_, i64>(2)? as usize,
        tokens: row.get(3)?,
        amount: row.get(4)?,
        asset: row.get(5)?,
        pay_url: row.get(6)?,
        status: InvoiceStatus::parse(&status),
        created_at: row.get(8)?,
    })
}

// ============== Store ==============

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::External("database mutex poisoned".to_string()))
    }

    // ---------- users ----------

    /// Insert the user with `starter_tokens` on first contact, otherwise refresh
    /// the first name. Returns the user and whether it was just created.
    pub fn ensure_user(
        &self,
        id: UserId,
        first_name: &str,
        starter_tokens: i64,
    ) -> Result<(User, bool)> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO users (id, first_name, balance, voice, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.0, first_name, starter_tokens.max(0), DEFAULT_VOICE, unix_now()],
        )? == 1;
        if !created {
            conn.execute(
                "UPDATE users SET first_name = ?2 WHERE id = ?1 AND first_name <> ?2",
                params![id.0, first_name],
            )?;
        }
        let user = conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
            [id.0],
            user_row,
        )?;
        Ok((user, created))
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                [id.0],
                user_row,
            )
            .optional()?)
    }

    pub fn all_user_ids(&self) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY created_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(UserId))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn set_voice_response(&self, id: UserId, enabled: bool) -> Result<()> {
        self.update_user(
            id,
            "UPDATE users SET voice_response = ?2 WHERE id = ?1",
            i64::from(enabled),
        )
    }

    pub fn set_voice(&self, id: UserId, voice: &str) -> Result<()> {
        self.update_user(id, "UPDATE users SET voice = ?2 WHERE id = ?1", voice)
    }

    pub fn set_active_conversation(&self, id: UserId, conversation_id: Option<&str>) -> Result<()> {
        self.update_user(
            id,
            "UPDATE users SET active_conversation_id = ?2 WHERE id = ?1",
            conversation_id,
        )
    }

    fn update_user(&self, id: UserId, sql: &str, value: impl rusqlite::ToSql) -> Result<()> {
        let conn = self.conn()?;
        if conn.execute(sql, params![id.0, value])? == 0 {
            return Err(Error::NotFound(format!("user {}", id.0)));
        }
        Ok(())
    }

    /// Add `delta` (may be negative) to the balance, flooring at zero.
    /// Returns the new balance.
    pub fn adjust_balance(&self, id: UserId, delta: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "UPDATE users SET balance = MAX(balance + ?2, 0) WHERE id = ?1 RETURNING balance",
            params![id.0, delta],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("user {}", id.0)))
    }

    // ---------- assistants ----------

    pub fn create_assistant(
        &self,
        owner: UserId,
        name: &str,
        instructions: Option<&str>,
        serverside_id: &str,
    ) -> Result<Assistant> {
        let assistant = Assistant {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner,
            name: name.to_string(),
            instructions: instructions.map(str::to_string),
            serverside_id: serverside_id.to_string(),
            created_at: unix_now(),
        };
        self.conn()?.execute(
            &format!("INSERT INTO assistants ({ASSISTANT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                assistant.id,
                assistant.owner_id.0,
                assistant.name,
                assistant.instructions,
                assistant.serverside_id,
                assistant.created_at
            ],
        )?;
        Ok(assistant)
    }

    pub fn get_assistant(&self, id: &str) -> Result<Option<Assistant>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {ASSISTANT_COLS} FROM assistants WHERE id = ?1"),
                [id],
                assistant_row,
            )
            .optional()?)
    }

    pub fn find_personal_assistant(&self, owner: UserId) -> Result<Option<Assistant>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {ASSISTANT_COLS} FROM assistants
                     WHERE owner_id = ?1 AND lower(name) = lower(?2)
                     ORDER BY created_at, rowid LIMIT 1"
                ),
                params![owner.0, PERSONAL_ASSISTANT_NAME],
                assistant_row,
            )
            .optional()?)
    }

    /// Owned and guest assistants, oldest first.
    pub fn list_assistants_for(&self, user: UserId, page: u32) -> Result<Vec<Assistant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSISTANT_COLS} FROM assistants
             WHERE owner_id = ?1
                OR id IN (SELECT assistant_id FROM assistant_guests WHERE user_id = ?1)
             ORDER BY created_at, rowid
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![user.0, PAGE_SIZE, page_offset(page)],
                assistant_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_assistants_for(&self, user: UserId) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM assistants
             WHERE owner_id = ?1
                OR id IN (SELECT assistant_id FROM assistant_guests WHERE user_id = ?1)",
            [user.0],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    /// Owned assistants whose name contains `query`, case-insensitively.
    /// An empty query matches everything.
    pub fn search_owned(&self, owner: UserId, query: &str) -> Result<Vec<Assistant>> {
        let needle = query.trim().to_lowercase();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSISTANT_COLS} FROM assistants WHERE owner_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map([owner.0], assistant_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter(|a| needle.is_empty() || a.name.to_lowercase().contains(&needle))
            .collect())
    }

    /// Remove the assistant with its guest links, conversations and messages.
    pub fn delete_assistant(&self, id: &str) -> Result<Option<Assistant>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {ASSISTANT_COLS} FROM assistants WHERE id = ?1"),
                [id],
                assistant_row,
            )
            .optional()?;
        if existing.is_some() {
            tx.execute(
                "UPDATE users SET active_conversation_id = NULL
                 WHERE active_conversation_id IN
                   (SELECT id FROM conversations WHERE assistant_id = ?1)",
                [id],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id IN
                   (SELECT id FROM conversations WHERE assistant_id = ?1)",
                [id],
            )?;
            tx.execute("DELETE FROM conversations WHERE assistant_id = ?1", [id])?;
            tx.execute("DELETE FROM assistant_guests WHERE assistant_id = ?1", [id])?;
            tx.execute("DELETE FROM assistants WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(existing)
    }

    pub fn is_owner(&self, user: UserId, assistant_id: &str) -> Result<bool> {
        self.exists(
            "SELECT 1 FROM assistants WHERE id = ?1 AND owner_id = ?2",
            assistant_id,
            user,
        )
    }

    pub fn is_guest(&self, user: UserId, assistant_id: &str) -> Result<bool> {
        self.exists(
            "SELECT 1 FROM assistant_guests WHERE assistant_id = ?1 AND user_id = ?2",
            assistant_id,
            user,
        )
    }

    fn exists(&self, sql: &str, assistant_id: &str, user: UserId) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(sql, params![assistant_id, user.0], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn add_guest(&self, assistant_id: &str, user: UserId) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "INSERT OR IGNORE INTO assistant_guests (assistant_id, user_id) VALUES (?1, ?2)",
            params![assistant_id, user.0],
        )? == 1)
    }

    /// Drop the guest link; conversations the guest had with it go too.
    pub fn remove_guest(&self, assistant_id: &str, user: UserId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM assistant_guests WHERE assistant_id = ?1 AND user_id = ?2",
            params![assistant_id, user.0],
        )? == 1;
        if removed {
            tx.execute(
                "UPDATE users SET active_conversation_id = NULL
                 WHERE id = ?2 AND active_conversation_id IN
                   (SELECT id FROM conversations WHERE assistant_id = ?1 AND user_id = ?2)",
                params![assistant_id, user.0],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id IN
                   (SELECT id FROM conversations WHERE assistant_id = ?1 AND user_id = ?2)",
                params![assistant_id, user.0],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE assistant_id = ?1 AND user_id = ?2",
                params![assistant_id, user.0],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn guest_count(&self, assistant_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM assistant_guests WHERE assistant_id = ?1",
            [assistant_id],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    // ---------- conversations ----------

    pub fn create_conversation(
        &self,
        user: UserId,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user,
            assistant_id: assistant_id.to_string(),
            thread_id: thread_id.to_string(),
            title: None,
            created_at: unix_now(),
        };
        self.conn()?.execute(
            &format!(
                "INSERT INTO conversations ({CONVERSATION_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                conversation.id,
                conversation.user_id.0,
                conversation.assistant_id,
                conversation.thread_id,
                conversation.title,
                conversation.created_at
            ],
        )?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1"),
                [id],
                conversation_row,
            )
            .optional()?)
    }

    pub fn list_conversations(&self, user: UserId, page: u32) -> Result<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLS} FROM conversations WHERE user_id = ?1
             ORDER BY created_at, rowid LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![user.0, PAGE_SIZE, page_offset(page)],
                conversation_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_conversations(&self, user: UserId) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
            [user.0],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let conn = self.conn()?;
        if conn.execute(
            "UPDATE conversations SET title = ?2 WHERE id = ?1",
            params![conversation_id, title],
        )? == 0
        {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        }
        Ok(())
    }

    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE users SET active_conversation_id = NULL WHERE active_conversation_id = ?1",
            [id],
        )?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])? == 1;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        tokens: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, role.as_str(), content, tokens, unix_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, tokens, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([conversation_id], message_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------- invoices ----------

    pub fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO invoices ({INVOICE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                invoice.invoice_id,
                invoice.user_id.0,
                invoice.plan_index as i64,
                invoice.tokens,
                invoice.amount,
                invoice.asset,
                invoice.pay_url,
                invoice.status.as_str(),
                invoice.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice(&self, invoice_id: i64) -> Result<Option<Invoice>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {INVOICE_COLS} FROM invoices WHERE invoice_id = ?1"),
                [invoice_id],
                invoice_row,
            )
            .optional()?)
    }

    /// Flip the invoice to paid and credit its tokens to the owner, atomically.
    /// Returns false unless the invoice was still active.
    pub fn mark_invoice_paid(&self, invoice_id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let flipped = tx.execute(
            "UPDATE invoices SET status = 'paid' WHERE invoice_id = ?1 AND status = 'active'",
            [invoice_id],
        )? == 1;
        if flipped {
            tx.execute(
                "UPDATE users SET balance = balance +
                   (SELECT tokens FROM invoices WHERE invoice_id = ?1)
                 WHERE id = (SELECT user_id FROM invoices WHERE invoice_id = ?1)",
                [invoice_id],
            )?;
        }
        tx.commit()?;
        Ok(flipped)
    }

    pub fn mark_invoice_expired(&self, invoice_id: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE invoices SET status = 'expired' WHERE invoice_id = ?1 AND status = 'active'",
            [invoice_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users(ids: &[i64]) -> Store {
        let store = Store::open_in_memory().unwrap();
        for id in ids {
            store.ensure_user(UserId(*id), "Ann", 100).unwrap();
        }
        store
    }

    #[test]
    fn ensure_user_grants_starter_tokens_once() {
        let store = Store::open_in_memory().unwrap();
        let (user, created) = store.ensure_user(UserId(1), "Ann", 5_000).unwrap();
        assert!(created);
        assert_eq!(user.balance, 5_000);
        assert_eq!(user.voice, DEFAULT_VOICE);
        assert!(!user.voice_response);

        store.adjust_balance(UserId(1), -1_000).unwrap();
        let (user, created) = store.ensure_user(UserId(1), "Annie", 5_000).unwrap();
        assert!(!created);
        assert_eq!(user.balance, 4_000);
        assert_eq!(user.first_name, "Annie");
    }

    #[test]
    fn balance_never_goes_negative() {
        let store = store_with_users(&[1]);
        assert_eq!(store.adjust_balance(UserId(1), -500).unwrap(), 0);
        assert_eq!(store.adjust_balance(UserId(1), 25).unwrap(), 25);
        assert!(matches!(
            store.adjust_balance(UserId(2), 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn user_settings_round_trip() {
        let store = store_with_users(&[1]);
        store.set_voice_response(UserId(1), true).unwrap();
        store.set_voice(UserId(1), "nova").unwrap();
        store.set_active_conversation(UserId(1), Some("c1")).unwrap();
        let user = store.get_user(UserId(1)).unwrap().unwrap();
        assert!(user.voice_response);
        assert_eq!(user.voice, "nova");
        assert_eq!(user.active_conversation_id.as_deref(), Some("c1"));
        assert!(store.set_voice(UserId(9), "nova").is_err());
    }

    #[test]
    fn assistant_listing_includes_guest_links_and_paginates() {
        let store = store_with_users(&[1, 2]);
        for i in 0..11 {
            store
                .create_assistant(UserId(1), &format!("bot {i}"), None, &format!("asst_{i}"))
                .unwrap();
        }
        let own = store
            .create_assistant(UserId(2), "Mine", Some("be nice"), "asst_x")
            .unwrap();
        let shared = store.search_owned(UserId(1), "BOT 1").unwrap();
        assert_eq!(shared.len(), 2); // "bot 1" and "bot 10"
        assert!(store.add_guest(&shared[0].id, UserId(2)).unwrap());
        assert!(!store.add_guest(&shared[0].id, UserId(2)).unwrap());

        assert_eq!(store.count_assistants_for(UserId(1)).unwrap(), 11);
        assert_eq!(store.count_assistants_for(UserId(2)).unwrap(), 2);
        assert_eq!(store.list_assistants_for(UserId(1), 1).unwrap().len(), 10);
        assert_eq!(store.list_assistants_for(UserId(1), 2).unwrap().len(), 1);
        assert_eq!(page_count(11), 2);
        assert_eq!(page_count(0), 0);
        let first = Page::new(vec![1], 1, 11);
        assert!(!first.has_prev() && first.has_next());
        let last = Page::new(vec![1], 2, 11);
        assert!(last.has_prev() && !last.has_next());

        let for_guest: Vec<String> = store
            .list_assistants_for(UserId(2), 1)
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert!(for_guest.contains(&own.id) && for_guest.contains(&shared[0].id));
        assert!(store.is_guest(UserId(2), &shared[0].id).unwrap());
        assert!(!store.is_owner(UserId(2), &shared[0].id).unwrap());
        assert_eq!(store.guest_count(&shared[0].id).unwrap(), 1);
    }

    #[test]
    fn personal_assistant_lookup_is_case_insensitive() {
        let store = store_with_users(&[1]);
        assert!(store.find_personal_assistant(UserId(1)).unwrap().is_none());
        let a = store
            .create_assistant(UserId(1), "personal Assistant", None, "asst_p")
            .unwrap();
        assert!(a.is_personal());
        assert_eq!(store.find_personal_assistant(UserId(1)).unwrap(), Some(a));
    }

    #[test]
    fn deleting_assistant_cascades() {
        let store = store_with_users(&[1, 2]);
        let a = store.create_assistant(UserId(1), "bot", None, "asst_1").unwrap();
        store.add_guest(&a.id, UserId(2)).unwrap();
        let c = store.create_conversation(UserId(2), &a.id, "thread_1").unwrap();
        store.append_message(&c.id, Role::User, "hi", 3).unwrap();
        store.set_active_conversation(UserId(2), Some(&c.id)).unwrap();

        assert_eq!(store.delete_assistant(&a.id).unwrap(), Some(a.clone()));
        assert!(store.get_assistant(&a.id).unwrap().is_none());
        assert!(store.get_conversation(&c.id).unwrap().is_none());
        assert!(store.list_messages(&c.id).unwrap().is_empty());
        assert_eq!(store.guest_count(&a.id).unwrap(), 0);
        let guest = store.get_user(UserId(2)).unwrap().unwrap();
        assert!(guest.active_conversation_id.is_none());
        assert!(store.delete_assistant(&a.id).unwrap().is_none());
    }

    #[test]
    fn removing_guest_drops_their_conversations_only() {
        let store = store_with_users(&[1, 2]);
        let a = store.create_assistant(UserId(1), "bot", None, "asst_1").unwrap();
        store.add_guest(&a.id, UserId(2)).unwrap();
        let owner_conv = store.create_conversation(UserId(1), &a.id, "t1").unwrap();
        let guest_conv = store.create_conversation(UserId(2), &a.id, "t2").unwrap();

        assert!(store.remove_guest(&a.id, UserId(2)).unwrap());
        assert!(store.get_conversation(&guest_conv.id).unwrap().is_none());
        assert!(store.get_conversation(&owner_conv.id).unwrap().is_some());
        assert!(!store.remove_guest(&a.id, UserId(2)).unwrap());
    }

    #[test]
    fn conversations_and_messages() {
        let store = store_with_users(&[1]);
        let a = store.create_assistant(UserId(1), "bot", None, "asst_1").unwrap();
        let c = store.create_conversation(UserId(1), &a.id, "thread_1").unwrap();
        assert_eq!(c.title, None);
        store.set_title(&c.id, "Trip plans").unwrap();
        store.append_message(&c.id, Role::User, "hi", 3).unwrap();
        store.append_message(&c.id, Role::Assistant, "hello", 5).unwrap();

        let msgs = store.list_messages(&c.id).unwrap();
        assert_eq!(
            msgs.iter().map(|m| (m.role, m.tokens)).collect::<Vec<_>>(),
            vec![(Role::User, 3), (Role::Assistant, 5)]
        );
        let listed = store.list_conversations(UserId(1), 1).unwrap();
        assert_eq!(listed[0].title.as_deref(), Some("Trip plans"));
        assert_eq!(store.count_conversations(UserId(1)).unwrap(), 1);

        assert!(store.delete_conversation(&c.id).unwrap());
        assert!(store.list_messages(&c.id).unwrap().is_empty());
        assert!(store.set_title(&c.id, "x").is_err());
    }

    #[test]
    fn invoice_is_credited_once() {
        let store = store_with_users(&[1]);
        store
            .insert_invoice(&Invoice {
                invoice_id: 77,
                user_id: UserId(1),
                plan_index: 0,
                tokens: 10_000,
                amount: "3.99".to_string(),
                asset: "USDT".to_string(),
                pay_url: "https://t.me/CryptoTestnetBot?start=x".to_string(),
                status: InvoiceStatus::Active,
                created_at: 0,
            })
            .unwrap();

        assert!(store.mark_invoice_paid(77).unwrap());
        assert!(!store.mark_invoice_paid(77).unwrap());
        assert!(!store.mark_invoice_paid(78).unwrap());
        assert_eq!(store.get_user(UserId(1)).unwrap().unwrap().balance, 10_100);
        assert_eq!(
            store.get_invoice(77).unwrap().unwrap().status,
            InvoiceStatus::Paid
        );

        store
            .insert_invoice(&Invoice {
                invoice_id: 79,
                status: InvoiceStatus::Active,
                ..store.get_invoice(77).unwrap().unwrap()
            })
            .unwrap();
        store.mark_invoice_expired(79).unwrap();
        assert!(!store.mark_invoice_paid(79).unwrap());
        assert_eq!(store.get_user(UserId(1)).unwrap().unwrap().balance, 10_100);
        assert_eq!(
            store.get_invoice(79).unwrap().unwrap().status,
            InvoiceStatus::Expired
        );
    }
}
