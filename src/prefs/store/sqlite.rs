//! SQLite-backed preference store.
//!
//! All preferences live in a single `prefs` table:
//!
//! | column      | meaning                                        |
//! |-------------|------------------------------------------------|
//! | `domain`    | canonical host, or `''` for global preferences |
//! | `name`      | preference name                                |
//! | `private`   | `1` for the private partition, else `0`        |
//! | `value`     | JSON-encoded value                             |
//!
//! `''` stands in for "global" because SQLite treats `NULL`s as distinct in
//! primary keys, which would break the upsert. Hosts are never empty.
//!
//! Database access goes through an `r2d2` pool; the store is `Send + Sync` and
//! may be shared behind an `Arc`.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::types::Value as SqlValue;
use r2d2_sqlite::rusqlite::{params, params_from_iter, OpenFlags, OptionalExtension, Row};
use r2d2_sqlite::SqliteConnectionManager;

use crate::prefs::domain::Host;
use crate::prefs::store::PrefStorage;
use crate::prefs::types::{
    Partition, PartitionSet, PrefEntry, PrefFilter, PrefKey, PrefValue, Scope, ScopeFilter,
};

const GLOBAL_DOMAIN: &str = "";

/// SQLite-based preference store
pub struct SqlitePrefStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqlitePrefStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(|c| {
                c.busy_timeout(Duration::from_millis(500))?;
                c.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS prefs (
                        domain TEXT NOT NULL,
                        name TEXT NOT NULL,
                        private INTEGER NOT NULL,
                        value TEXT NOT NULL,
                        updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                        PRIMARY KEY(domain, name, private)
                    );
                    CREATE INDEX IF NOT EXISTS prefs_name ON prefs(name);",
                )?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .with_context(|| format!("cannot open preference database {}", path.as_ref().display()))?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Number of rows in the table.
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM prefs", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn domain_column(scope: &Scope) -> &str {
    match scope {
        Scope::Global => GLOBAL_DOMAIN,
        Scope::Domain(h) => h.as_str(),
    }
}

fn private_column(partition: Partition) -> i64 {
    partition.is_private() as i64
}

/// Translates a filter into a `WHERE` clause plus its positional parameters.
fn where_clause(filter: &PrefFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    match &filter.scope {
        ScopeFilter::Any => {}
        ScopeFilter::Global => clauses.push("domain = ''"),
        ScopeFilter::AnyDomain => clauses.push("domain <> ''"),
        ScopeFilter::Domain(host) => {
            clauses.push("domain = ?");
            params.push(SqlValue::Text(host.as_str().to_string()));
        }
        ScopeFilter::Subdomain(host) => {
            // domain == host, or domain ends with "." + host
            clauses.push("(domain = ? OR (length(domain) > length(?) AND substr(domain, -length(?) - 1) = '.' || ?))");
            for _ in 0..4 {
                params.push(SqlValue::Text(host.as_str().to_string()));
            }
        }
    }

    if let Some(name) = &filter.name {
        clauses.push("name = ?");
        params.push(SqlValue::Text(name.clone()));
    }

    if filter.partitions.is_empty() {
        clauses.push("0");
    } else if filter.partitions == PartitionSet::NORMAL {
        clauses.push("private = 0");
    } else if filter.partitions == PartitionSet::PRIVATE {
        clauses.push("private = 1");
    }

    if clauses.is_empty() {
        ("1".to_string(), params)
    } else {
        (clauses.join(" AND "), params)
    }
}

fn row_to_entry(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<(PrefKey, String)> {
    let domain: String = row.get(0)?;
    let name: String = row.get(1)?;
    let private: i64 = row.get(2)?;
    let value: String = row.get(3)?;

    let scope = if domain == GLOBAL_DOMAIN {
        Scope::Global
    } else {
        Scope::Domain(Host::from_canonical(domain))
    };
    let partition = if private != 0 { Partition::Private } else { Partition::Normal };
    Ok((PrefKey::new(scope, name, partition), value))
}

impl PrefStorage for SqlitePrefStore {
    fn upsert(&self, entry: &PrefEntry) -> Result<()> {
        let conn = self.conn()?;
        let value = serde_json::to_string(&entry.value)?;
        conn.execute(
            "INSERT INTO prefs(domain, name, private, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain, name, private) DO UPDATE
             SET value=excluded.value, updated_at=strftime('%s','now')",
            params![
                domain_column(&entry.key.scope),
                entry.key.name,
                private_column(entry.key.partition),
                value
            ],
        )?;
        Ok(())
    }

    fn delete_where(&self, filter: &PrefFilter) -> Result<Vec<PrefKey>> {
        let (clause, args) = where_clause(filter);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT domain, name, private, value FROM prefs WHERE {} ORDER BY domain, name, private",
                clause
            ))?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_entry)?;
            rows.map(|r| r.map(|(key, _)| key)).collect::<Result<Vec<_>, _>>()?
        };

        if !removed.is_empty() {
            tx.execute(&format!("DELETE FROM prefs WHERE {}", clause), params_from_iter(args.iter()))?;
        }
        tx.commit()?;

        Ok(removed)
    }

    fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM prefs WHERE domain=?1 AND name=?2 AND private=?3",
                params![domain_column(&key.scope), key.name, private_column(key.partition)],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s).with_context(|| format!("corrupt value for {}", key))?)),
            None => Ok(None),
        }
    }

    fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>> {
        let (clause, args) = where_clause(filter);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT domain, name, private, value FROM prefs WHERE {} ORDER BY domain, name, private",
            clause
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            let value = serde_json::from_str(&raw).with_context(|| format!("corrupt value for {}", key))?;
            entries.push(PrefEntry { key, value });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
