//! Persisted store: chats, messages, identity directory, sessions.
//!
//! All group-chat mutations go through [`update_chat_if`], a single
//! conditional-update primitive whose WHERE clause re-checks the
//! authorization precondition at write time. Two racing writers cannot both
//! succeed on a stale precondition; the loser observes a no-match result.

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

use crate::events::{MemberDto, MessageDto, UserId};

/// Initialize the database connection pool, creating the file and schema on
/// first run.
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        info!("Creating database at {}", database_url);
        Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            FOREIGN KEY (user_id) REFERENCES users(id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Membership is a JSON array in the chat row so that every mutation is a
    // single conditional UPDATE against the same row that holds the admin
    // field. direct_key is the sorted member pair of a direct chat; its
    // UNIQUE index closes the duplicate-direct-chat race at write time.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            is_group INTEGER NOT NULL,
            name TEXT,
            admin TEXT,
            about TEXT,
            picture TEXT,
            members TEXT NOT NULL,
            direct_key TEXT UNIQUE,
            latest_message_id TEXT,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages(chat_id, created_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Identity directory / sessions
// ---------------------------------------------------------------------------

pub async fn upsert_user(pool: &Pool<Sqlite>, id: &str, name: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, name) VALUES (?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
    )
    .bind(id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn user_exists(pool: &Pool<Sqlite>, id: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Keep only identities that exist in the directory, preserving order.
pub async fn filter_existing_users(pool: &Pool<Sqlite>, ids: &[UserId]) -> Result<Vec<UserId>> {
    let mut existing = Vec::with_capacity(ids.len());
    for id in ids {
        if user_exists(pool, id).await? {
            existing.push(id.clone());
        }
    }
    Ok(existing)
}

/// Display data for a broadcast payload. Callers treat a failure here as
/// degraded success, not as an error.
pub async fn member_summaries(pool: &Pool<Sqlite>, ids: &[UserId]) -> Result<Vec<MemberDto>> {
    let mut members = Vec::with_capacity(ids.len());
    for id in ids {
        let name: Option<(Option<String>,)> = sqlx::query_as("SELECT name FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        members.push(MemberDto {
            id: id.clone(),
            name: name.and_then(|(n,)| n),
        });
    }
    Ok(members)
}

pub async fn create_session(pool: &Pool<Sqlite>, token: &str, user_id: &str) -> Result<()> {
    sqlx::query("INSERT INTO sessions (token, user_id) VALUES (?, ?)")
        .bind(token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn resolve_session(pool: &Pool<Sqlite>, token: &str) -> Result<Option<UserId>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT user_id FROM sessions WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(user_id,)| user_id))
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub admin: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub members: Vec<UserId>,
    pub latest_message_id: Option<String>,
    pub created_at: i64,
}

const CHAT_COLUMNS: &str =
    "id, is_group, name, admin, about, picture, members, latest_message_id, created_at";

type ChatRow = (
    String,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    i64,
);

fn chat_from_row(row: ChatRow) -> Result<ChatRecord> {
    let (id, is_group, name, admin, about, picture, members, latest_message_id, created_at) = row;
    let members: Vec<UserId> = serde_json::from_str(&members)?;
    Ok(ChatRecord {
        id,
        is_group,
        name,
        admin,
        about,
        picture,
        members,
        latest_message_id,
        created_at,
    })
}

pub fn members_json(members: &[UserId]) -> String {
    serde_json::to_string(members).unwrap_or_else(|_| "[]".to_string())
}

/// Canonical key for the unordered member pair of a direct chat.
pub fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

pub async fn get_chat(pool: &Pool<Sqlite>, chat_id: &str) -> Result<Option<ChatRecord>> {
    let row: Option<ChatRow> =
        sqlx::query_as(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(chat_id)
            .fetch_optional(pool)
            .await?;
    row.map(chat_from_row).transpose()
}

pub async fn find_direct_chat(pool: &Pool<Sqlite>, a: &str, b: &str) -> Result<Option<ChatRecord>> {
    let row: Option<ChatRow> =
        sqlx::query_as(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE direct_key = ?"))
            .bind(direct_key(a, b))
            .fetch_optional(pool)
            .await?;
    row.map(chat_from_row).transpose()
}

pub enum DirectInsert {
    Created,
    /// A concurrent creator won the race; here is their chat.
    Existing(ChatRecord),
}

/// Insert a direct chat for the pair, deferring duplicate detection to the
/// UNIQUE constraint on direct_key.
pub async fn insert_direct_chat(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    a: &str,
    b: &str,
) -> Result<DirectInsert> {
    let members = members_json(&[a.to_string(), b.to_string()]);
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO chats (id, is_group, members, direct_key) VALUES (?, 0, ?, ?)",
    )
    .bind(chat_id)
    .bind(&members)
    .bind(direct_key(a, b))
    .execute(pool)
    .await?;

    if inserted.rows_affected() > 0 {
        return Ok(DirectInsert::Created);
    }
    match find_direct_chat(pool, a, b).await? {
        Some(chat) => Ok(DirectInsert::Existing(chat)),
        None => anyhow::bail!("direct chat insert matched nothing and pair lookup came up empty"),
    }
}

pub async fn insert_group_chat(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    name: &str,
    admin: &str,
    members: &[UserId],
    about: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO chats (id, is_group, name, admin, about, members) VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(chat_id)
    .bind(name)
    .bind(admin)
    .bind(about)
    .bind(members_json(members))
    .execute(pool)
    .await?;
    Ok(())
}

/// Precondition re-checked inside the UPDATE's WHERE clause.
#[derive(Default)]
pub struct Precondition<'a> {
    /// Row must still be a group chat with this admin.
    pub admin: Option<&'a str>,
    /// Row's membership must still equal this exact JSON snapshot.
    pub members_json: Option<&'a str>,
}

pub enum ChatPatch<'a> {
    Name(&'a str),
    About(&'a str),
    Picture(&'a str),
    Admin(Option<&'a str>),
    Members(&'a [UserId]),
}

/// The one conditional-update primitive shared by every mutating operation.
/// Returns false when the precondition no longer held at write time (or the
/// chat is gone); callers classify that with a diagnostic read.
pub async fn update_chat_if(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    pre: Precondition<'_>,
    patches: &[ChatPatch<'_>],
) -> Result<bool> {
    let mut sets = Vec::with_capacity(patches.len());
    for patch in patches {
        sets.push(match patch {
            ChatPatch::Name(_) => "name = ?",
            ChatPatch::About(_) => "about = ?",
            ChatPatch::Picture(_) => "picture = ?",
            ChatPatch::Admin(_) => "admin = ?",
            ChatPatch::Members(_) => "members = ?",
        });
    }

    let mut sql = format!("UPDATE chats SET {} WHERE id = ?", sets.join(", "));
    if pre.admin.is_some() {
        sql.push_str(" AND is_group = 1 AND admin = ?");
    }
    if pre.members_json.is_some() {
        sql.push_str(" AND members = ?");
    }

    let mut query = sqlx::query(&sql);
    for patch in patches {
        query = match patch {
            ChatPatch::Name(v) => query.bind(*v),
            ChatPatch::About(v) => query.bind(*v),
            ChatPatch::Picture(v) => query.bind(*v),
            ChatPatch::Admin(v) => query.bind(*v),
            ChatPatch::Members(v) => query.bind(members_json(v)),
        };
    }
    query = query.bind(chat_id);
    if let Some(admin) = pre.admin {
        query = query.bind(admin);
    }
    if let Some(members) = pre.members_json {
        query = query.bind(members);
    }

    let result = query.execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a chat (admin-checked at write time) and cascade to its messages,
/// in one transaction.
pub async fn delete_chat_if_admin(pool: &Pool<Sqlite>, chat_id: &str, admin: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query("DELETE FROM chats WHERE id = ? AND is_group = 1 AND admin = ?")
        .bind(chat_id)
        .bind(admin)
        .execute(&mut *tx)
        .await?;

    if deleted.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query("DELETE FROM messages WHERE chat_id = ?")
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Insert a message and advance the parent chat's latest-message pointer in
/// one transaction. Returns None, with nothing persisted, when the chat no
/// longer exists; a deleted conversation must not accumulate orphaned rows
/// outside its cascade.
pub async fn insert_message(
    pool: &Pool<Sqlite>,
    id: &str,
    chat_id: &str,
    sender_id: &str,
    content: &str,
) -> Result<Option<MessageDto>> {
    let created_at = now_unix();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(chat_id)
    .bind(sender_id)
    .bind(content)
    .bind(created_at)
    .execute(&mut *tx)
    .await?;

    let bumped = sqlx::query("UPDATE chats SET latest_message_id = ? WHERE id = ?")
        .bind(id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
    if bumped.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    tx.commit().await?;
    Ok(Some(MessageDto {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        created_at,
    }))
}

pub async fn get_message(pool: &Pool<Sqlite>, id: &str) -> Result<Option<MessageDto>> {
    let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
        "SELECT id, chat_id, sender_id, content, created_at FROM messages WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, chat_id, sender_id, content, created_at)| MessageDto {
        id,
        chat_id,
        sender_id,
        content,
        created_at,
    }))
}

pub async fn list_messages(pool: &Pool<Sqlite>, chat_id: &str) -> Result<Vec<MessageDto>> {
    let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
        "SELECT id, chat_id, sender_id, content, created_at FROM messages
         WHERE chat_id = ? ORDER BY created_at, id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, chat_id, sender_id, content, created_at)| MessageDto {
            id,
            chat_id,
            sender_id,
            content,
            created_at,
        })
        .collect())
}

pub async fn count_messages(pool: &Pool<Sqlite>, chat_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
        .bind(chat_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
