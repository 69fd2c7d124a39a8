//! Schema migrations, applied in order and recorded in `schema_migrations`

use crate::error::{Result, SqliteStoreError};
use rusqlite::{Connection, params};

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        "
        CREATE TABLE resources (
            id TEXT NOT NULL,
            scope_chain TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (id, scope_chain)
        );
        CREATE TABLE scopes (
            chain TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );
        ",
    ),
    (
        2,
        "CREATE INDEX idx_resources_scope_chain ON resources(scope_chain);",
    ),
];

/// Latest schema version this build knows about
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|(version, _)| *version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

/// Bring the schema up to date; returns the number of migrations applied
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current = current_version(conn)?;
    if current > latest_version() {
        return Err(SqliteStoreError::SchemaTooNew {
            found: current,
            supported: latest_version(),
        });
    }

    let mut applied = 0;
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| SqliteStoreError::Migration {
                version: *version,
                message: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::debug!("Applied schema migration {}", version);
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(migrate(&mut conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (99, 'later')",
            [],
        )
        .unwrap();

        assert!(matches!(
            migrate(&mut conn),
            Err(SqliteStoreError::SchemaTooNew { found: 99, .. })
        ));
    }
}
