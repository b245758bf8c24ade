//! SQLite handle and versioned schema migrations.
//!
//! The database is opened in WAL mode on a single connection; every other
//! component reaches SQLite through the [`crate::store::Store`] that takes
//! ownership of this connection.

use rusqlite::Connection;

/// Embedded migrations, applied in version order inside a transaction each.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("apply migration {0}: {1}")]
    Migration(i64, rusqlite::Error),
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Apply every pending migration. A failure leaves the schema at the
    /// last fully-applied version and must abort startup.
    pub fn migrate(&mut self) -> Result<(), DbError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
            [],
        )?;

        for (version, sql) in MIGRATIONS {
            let applied: i64 = self.conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )?;
            if applied > 0 {
                continue;
            }

            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)
                .map_err(|err| DbError::Migration(*version, err))?;
            let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now],
            )?;
            tx.commit()?;
        }

        Ok(())
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}
