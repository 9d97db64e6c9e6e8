use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            account_number TEXT NOT NULL UNIQUE,
            owner TEXT,
            initial_balance_cents INTEGER NOT NULL DEFAULT 0,
            balance_cents INTEGER NOT NULL DEFAULT 0,
            open_at TEXT NOT NULL,
            closed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subcategories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT,
            description TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            transaction_date TEXT NOT NULL,
            posted_date TEXT,
            account_number TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            linked_staging_id INTEGER,
            transfer_group_id TEXT,
            categorized INTEGER NOT NULL DEFAULT 0,
            mapped_subcategory_id INTEGER,
            mapped_account_id INTEGER,
            imported_transaction_id INTEGER,
            imported_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pairing_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            left_id INTEGER NOT NULL,
            right_id INTEGER NOT NULL,
            score REAL NOT NULL,
            reasons TEXT NOT NULL,
            preselected INTEGER NOT NULL DEFAULT 0,
            decision TEXT,
            decided_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (left_id) REFERENCES staging_transactions(id),
            FOREIGN KEY (right_id) REFERENCES staging_transactions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categorization_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            staging_tx_id INTEGER NOT NULL,
            subcategory_id INTEGER NOT NULL,
            score REAL NOT NULL,
            confidence REAL NOT NULL,
            reasons TEXT NOT NULL,
            rule_tags TEXT NOT NULL DEFAULT '',
            preselected INTEGER NOT NULL DEFAULT 0,
            decision TEXT,
            decided_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (staging_tx_id) REFERENCES staging_transactions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            amount_cents INTEGER NOT NULL,
            tx_type TEXT NOT NULL,
            subcategory_id INTEGER,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            linked_transaction_id INTEGER,
            transfer_group_id TEXT,
            is_reconciled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staging_status ON staging_transactions(status, categorized)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cat_candidates_row ON categorization_candidates(staging_tx_id, decision)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pair_candidates_pending ON pairing_candidates(decision)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_setting(pool: &DbPool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query_as::<_, (String,)>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

pub async fn set_setting(pool: &DbPool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_subcategory(pool: &DbPool, name: &str) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO subcategories (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn subcategory_exists(pool: &DbPool, id: i64) -> Result<bool, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM subcategories WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(row.0 > 0)
}
