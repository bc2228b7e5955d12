use anyhow::{Result, bail};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Instant;

use crate::file_service::FilePatch;
use crate::log_db_operation;
use crate::models::*;

const CARD_COLUMNS: &str =
    "id, card_id, user_id, title, body, link, is_deleted, created_at, updated_at";
const PARTIAL_CARD_COLUMNS: &str = "id, card_id, user_id, title, created_at, updated_at";
const FILE_COLUMNS: &str = "id, name, type, path, filename, size, card_pk, created_by, updated_by, is_deleted, created_at, updated_at";
const USER_COLUMNS: &str = "id, username, password, created_at, updated_at";
const CATEGORY_COLUMNS: &str = "id, user_id, name, description, regex, is_active, created_by, updated_by, created_at, updated_at";

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        card_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        link TEXT,
        is_deleted BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    );
    "#,
    // Backs the application-level uniqueness check; closes the check-then-insert window
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_cards_active_card_id
        ON cards(card_id) WHERE is_deleted = 0 AND card_id <> '';
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backlinks (
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (source_id, target_id)
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_backlinks_target ON backlinks(target_id);",
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        path TEXT NOT NULL,
        filename TEXT NOT NULL,
        size INTEGER NOT NULL,
        card_pk INTEGER,
        created_by INTEGER NOT NULL,
        updated_by INTEGER NOT NULL,
        is_deleted BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (card_pk) REFERENCES cards(id),
        FOREIGN KEY (created_by) REFERENCES users(id),
        FOREIGN KEY (updated_by) REFERENCES users(id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        regex TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_by INTEGER NOT NULL,
        updated_by INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS card_views (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        card_pk INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (card_pk) REFERENCES cards(id),
        FOREIGN KEY (user_id) REFERENCES users(id)
    );
    "#,
];

/// Metadata for a blob that has already been written to storage.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub file_type: String,
    pub path: String,
    pub filename: String,
    pub size: i64,
    pub card_pk: Option<i64>,
    pub user_id: i64,
}

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        if !database_url.starts_with("sqlite:") {
            bail!("unsupported database URL '{}': expected a sqlite: URL", database_url);
        }
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives only as long as its single connection
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };

        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        log_db_operation!(info, "migrate", "schema is up to date");
        Ok(())
    }

    // User operations
    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (username, password, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(User {
            id,
            username: username.to_string(),
            password: password_hash.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn update_user_password(&self, id: i64, password_hash: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET password = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Card reads
    pub async fn get_card(&self, id: i64) -> Result<Option<Card>> {
        let mut conn = self.pool.acquire().await?;
        fetch_card(&mut conn, id).await
    }

    pub async fn get_partial_card(&self, id: i64) -> Result<Option<PartialCard>> {
        let card = sqlx::query_as::<_, PartialCard>(&format!(
            "SELECT {PARTIAL_CARD_COLUMNS} FROM cards WHERE id = ?1 AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(card)
    }

    /// Non-deleted cards whose card_id, title or body contains `search_term`.
    pub async fn search_cards(&self, search_term: Option<&str>) -> Result<Vec<Card>> {
        let started = Instant::now();
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE is_deleted = 0"
        ));
        push_search_filter(&mut query, search_term);
        let cards = query.build_query_as::<Card>().fetch_all(&self.pool).await?;

        log_db_operation!(
            debug,
            "search_cards",
            count = cards.len(),
            duration_ms = started.elapsed().as_millis() as u64
        );
        Ok(cards)
    }

    pub async fn search_partial_cards(&self, search_term: Option<&str>) -> Result<Vec<PartialCard>> {
        let started = Instant::now();
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {PARTIAL_CARD_COLUMNS} FROM cards WHERE is_deleted = 0"
        ));
        push_search_filter(&mut query, search_term);
        let cards = query
            .build_query_as::<PartialCard>()
            .fetch_all(&self.pool)
            .await?;

        log_db_operation!(
            debug,
            "search_partial_cards",
            count = cards.len(),
            duration_ms = started.elapsed().as_millis() as u64
        );
        Ok(cards)
    }

    /// Cards whose bodies reference `card_id`.
    pub async fn get_referencing_cards(&self, card_id: &str) -> Result<Vec<PartialCard>> {
        let cards = sqlx::query_as::<_, PartialCard>(
            r#"
            SELECT c.id, c.card_id, c.user_id, c.title, c.created_at, c.updated_at
            FROM backlinks b
            JOIN cards c ON c.card_id = b.source_id AND c.is_deleted = 0
            WHERE b.target_id = ?1
            ORDER BY c.card_id
            "#,
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(cards)
    }

    pub async fn log_card_view(&self, card_pk: i64, user_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO card_views (card_pk, user_id, created_at) VALUES (?1, ?2, ?3)")
            .bind(card_pk)
            .bind(user_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_card_views(&self, card_pk: i64) -> Result<Vec<CardView>> {
        let views = sqlx::query_as::<_, CardView>(
            "SELECT id, card_pk, user_id, created_at FROM card_views WHERE card_pk = ?1 ORDER BY id",
        )
        .bind(card_pk)
        .fetch_all(&self.pool)
        .await?;
        Ok(views)
    }

    // File operations
    pub async fn insert_file(&self, file: &NewFile) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO files (name, type, path, filename, size, card_pk,
                               created_by, updated_by, is_deleted, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, ?8, ?8)
            "#,
        )
        .bind(&file.name)
        .bind(&file.file_type)
        .bind(&file.path)
        .bind(&file.filename)
        .bind(file.size)
        .bind(file.card_pk)
        .bind(file.user_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?1 AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    pub async fn list_files(&self) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE is_deleted = 0 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    pub async fn list_files_for_card(&self, card_pk: i64) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE card_pk = ?1 AND is_deleted = 0 ORDER BY id"
        ))
        .bind(card_pk)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Apply an allow-listed patch to a live file row. Returns false when no row matched.
    pub async fn update_file(&self, id: i64, patch: &FilePatch, updated_by: i64) -> Result<bool> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE files SET ");
        let mut fields = query.separated(", ");
        if let Some(name) = &patch.name {
            fields.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(card_pk) = patch.card_pk {
            fields.push("card_pk = ").push_bind_unseparated(card_pk);
        }
        fields.push("updated_by = ").push_bind_unseparated(updated_by);
        fields.push("updated_at = ").push_bind_unseparated(Utc::now());
        query
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" AND is_deleted = 0");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_file(&self, id: i64, updated_by: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET is_deleted = 1, updated_by = ?1, updated_at = ?2 WHERE id = ?3 AND is_deleted = 0",
        )
        .bind(updated_by)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // Category operations
    pub async fn create_category(
        &self,
        user_id: i64,
        request: &CreateCategoryRequest,
        created_by: i64,
    ) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO categories (user_id, name, description, regex, is_active,
                                    created_by, updated_by, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?7)
            "#,
        )
        .bind(user_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.regex)
        .bind(request.is_active)
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn update_category(
        &self,
        id: i64,
        request: &UpdateCategoryRequest,
        updated_by: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE categories
            SET name = ?1, description = ?2, regex = ?3,
                is_active = COALESCE(?4, is_active),
                updated_by = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.regex)
        .bind(request.is_active)
        .bind(updated_by)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let category = sqlx::query_as::<_, Category>(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(category)
    }

    pub async fn list_active_categories(&self, user_id: i64) -> Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE user_id = ?1 AND is_active = 1 ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(categories)
    }
}

fn push_search_filter(query: &mut QueryBuilder<'_, Sqlite>, search_term: Option<&str>) {
    let Some(term) = search_term.map(str::trim).filter(|t| !t.is_empty()) else {
        return;
    };
    let pattern = format!("%{}%", escape_like(term));
    query
        .push(" AND (card_id LIKE ")
        .push_bind(pattern.clone())
        .push(" ESCAPE '\\' OR title LIKE ")
        .push_bind(pattern.clone())
        .push(" ESCAPE '\\' OR body LIKE ")
        .push_bind(pattern)
        .push(" ESCAPE '\\')");
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

// Card writes take an explicit connection so callers can group them in one transaction.

pub async fn fetch_card(conn: &mut SqliteConnection, id: i64) -> Result<Option<Card>> {
    let card = sqlx::query_as::<_, Card>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1 AND is_deleted = 0"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(card)
}

/// True when a live card other than `exclude` already uses `card_id`.
pub async fn card_id_in_use(
    conn: &mut SqliteConnection,
    card_id: &str,
    exclude: Option<i64>,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM cards WHERE card_id = ?1 AND is_deleted = 0 AND (?2 IS NULL OR id <> ?2)",
    )
    .bind(card_id)
    .bind(exclude)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn insert_card(
    conn: &mut SqliteConnection,
    user_id: i64,
    request: &CreateCardRequest,
) -> Result<i64> {
    let now = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO cards (card_id, user_id, title, body, link, is_deleted, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
        "#,
    )
    .bind(&request.card_id)
    .bind(user_id)
    .bind(&request.title)
    .bind(&request.body)
    .bind(&request.link)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn update_card_row(
    conn: &mut SqliteConnection,
    id: i64,
    request: &UpdateCardRequest,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE cards
        SET card_id = ?1, title = ?2, body = ?3, link = ?4, updated_at = ?5
        WHERE id = ?6 AND is_deleted = 0
        "#,
    )
    .bind(&request.card_id)
    .bind(&request.title)
    .bind(&request.body)
    .bind(&request.link)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn soft_delete_card(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE cards SET is_deleted = 1, updated_at = ?1 WHERE id = ?2 AND is_deleted = 0",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
