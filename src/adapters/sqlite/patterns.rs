//! SQLite-backed subject pattern store
//!
//! Only the read side lives here; patterns and grants are written by the
//! administration tooling. The schema matches what that tooling creates:
//!
//! - `subjects`: the pattern catalogue
//! - `tenant_subjects`: which patterns each tenant has enabled
//! - `tenant_permissions`: comma-separated recipient allowlist per tenant

use rusqlite::params;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use super::pool::{create_memory_pool, create_pool, DbConnection, DbPool};
use crate::services::PatternStore;
use crate::types::error::Result;
use crate::types::{Role, SubjectPattern, TenantId, TenantPermission};

/// Stock patterns inserted on first start: (name, pattern, description)
const DEFAULT_PATTERNS: &[(&str, &str, &str)] = &[
    (
        "Netflix - Kode Akses Sementara (ID)",
        "Kode akses sementara Netflix-mu",
        "Netflix temporary access code, Indonesian",
    ),
    (
        "Netflix - Temporary Access Code (EN)",
        "Your Netflix temporary access code",
        "Netflix temporary access code, English",
    ),
    (
        "Netflix - Update Rumah Tangga (ID)",
        "Penting: Cara memperbarui Rumah dengan Akun Netflix-mu",
        "Netflix household update, Indonesian",
    ),
    (
        "Netflix - Update Household (EN)",
        "Important: How to update your Netflix Household",
        "Netflix household update, English",
    ),
    (
        "Netflix - Update Household (EN lowercase)",
        "Important: how to update your Netflix household",
        "Netflix household update, lower-case variant",
    ),
    (
        "Netflix - Kode Masuk (ID)",
        "Netflix: Kode masukmu",
        "Netflix sign-in code, Indonesian",
    ),
    (
        "Netflix - Sign-in Code (EN)",
        "Netflix: Your sign-in code",
        "Netflix sign-in code, English",
    ),
    (
        "Netflix - Reset Password (EN)",
        "Complete your password reset request",
        "Netflix password reset request",
    ),
    (
        "Netflix - Reset Sandi (ID)",
        "Selesaikan permintaanmu untuk mengatur ulang sandi",
        "Netflix password reset request, Indonesian",
    ),
];

pub struct SqlitePatternStore {
    pool: DbPool,
}

impl SqlitePatternStore {
    /// Open (or create) the store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            pool: create_pool(path.as_ref())?,
        };
        store.initialize_schema()?;
        info!("Pattern store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            pool: create_memory_pool()?,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                pattern TEXT UNIQUE NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS tenant_subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                subject_id INTEGER NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(tenant_id, subject_id),
                FOREIGN KEY (subject_id) REFERENCES subjects(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tenant_permissions (
                tenant_id INTEGER PRIMARY KEY,
                allowed_recipients TEXT NOT NULL DEFAULT '',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(())
    }

    /// Insert the stock patterns; existing rows are left alone.
    pub fn seed_default_patterns(&self) -> Result<usize> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO subjects (name, pattern, description) VALUES (?1, ?2, ?3)",
        )?;

        let mut inserted = 0;
        for (name, pattern, description) in DEFAULT_PATTERNS {
            inserted += stmt.execute(params![name, pattern, description])?;
        }

        if inserted > 0 {
            info!("Seeded {} default subject patterns", inserted);
        }
        Ok(inserted)
    }

    pub fn active_patterns(&self) -> Result<Vec<SubjectPattern>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, pattern, description, is_active
             FROM subjects
             WHERE is_active = 1
             ORDER BY id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SubjectPattern {
                id: row.get(0)?,
                name: row.get(1)?,
                pattern: row.get(2)?,
                description: row.get(3)?,
                active: row.get::<_, i64>(4)? != 0,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Grant for a tenant; tenants without any rows get an empty grant.
    pub fn tenant_permission(&self, tenant_id: TenantId) -> Result<TenantPermission> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            "SELECT subject_id FROM tenant_subjects
             WHERE tenant_id = ?1 AND is_enabled = 1",
        )?;
        let enabled_pattern_ids = stmt
            .query_map(params![tenant_id], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT allowed_recipients FROM tenant_permissions WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(TenantPermission {
            tenant_id,
            enabled_pattern_ids,
            allowed_recipients: split_recipients(raw.as_deref().unwrap_or_default()),
        })
    }
}

impl PatternStore for SqlitePatternStore {
    fn permitted_patterns(&self, tenant_id: TenantId, role: Role) -> Result<Vec<String>> {
        let active = self.active_patterns()?;

        let permitted: Vec<&SubjectPattern> = match role {
            Role::Admin => active.iter().collect(),
            Role::User => {
                let grant = self.tenant_permission(tenant_id)?;
                active
                    .iter()
                    .filter(|p| grant.enabled_pattern_ids.contains(&p.id))
                    .collect()
            }
        };

        let patterns = dedup_lowercase(permitted.iter().map(|p| p.pattern.as_str()));
        debug!(tenant_id, ?role, count = patterns.len(), "Resolved permitted patterns");
        Ok(patterns)
    }

    fn allowed_recipients(&self, tenant_id: TenantId) -> Result<Vec<String>> {
        Ok(self.tenant_permission(tenant_id)?.allowed_recipients)
    }
}

/// Parse a stored `a@x, b@y` list: trimmed, lower-cased, first occurrence wins.
pub fn split_recipients(raw: &str) -> Vec<String> {
    dedup_lowercase(raw.split(','))
}

fn dedup_lowercase<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim().to_lowercase();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlitePatternStore {
        let store = SqlitePatternStore::in_memory().expect("Failed to create in-memory store");
        store.seed_default_patterns().expect("Failed to seed patterns");
        store
    }

    fn pattern_id(store: &SqlitePatternStore, pattern: &str) -> i64 {
        store
            .connection()
            .unwrap()
            .query_row(
                "SELECT id FROM subjects WHERE pattern = ?1",
                params![pattern],
                |row| row.get(0),
            )
            .unwrap()
    }

    fn enable(store: &SqlitePatternStore, tenant_id: TenantId, pattern: &str) {
        let id = pattern_id(store, pattern);
        store
            .connection()
            .unwrap()
            .execute(
                "INSERT INTO tenant_subjects (tenant_id, subject_id) VALUES (?1, ?2)",
                params![tenant_id, id],
            )
            .unwrap();
    }

    #[test]
    fn test_seeding_is_idempotent() {
        let store = store();
        assert_eq!(store.seed_default_patterns().unwrap(), 0);
        assert_eq!(store.active_patterns().unwrap().len(), DEFAULT_PATTERNS.len());
    }

    #[test]
    fn test_admin_gets_every_active_pattern_lowercased_once() {
        let store = store();
        let patterns = store.permitted_patterns(1, Role::Admin).unwrap();

        // The two household variants differ only by case.
        assert_eq!(patterns.len(), DEFAULT_PATTERNS.len() - 1);
        assert!(patterns.contains(&"netflix: your sign-in code".to_string()));
        assert!(patterns.iter().all(|p| *p == p.to_lowercase()));
    }

    #[test]
    fn test_user_gets_only_enabled_active_patterns() {
        let store = store();
        enable(&store, 7, "Netflix: Your sign-in code");
        enable(&store, 7, "Complete your password reset request");

        store
            .connection()
            .unwrap()
            .execute(
                "UPDATE subjects SET is_active = 0 WHERE pattern = ?1",
                params!["Complete your password reset request"],
            )
            .unwrap();

        let patterns = store.permitted_patterns(7, Role::User).unwrap();
        assert_eq!(patterns, vec!["netflix: your sign-in code".to_string()]);

        assert!(store.permitted_patterns(8, Role::User).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_grant_is_ignored() {
        let store = store();
        let id = pattern_id(&store, "Netflix: Kode masukmu");
        store
            .connection()
            .unwrap()
            .execute(
                "INSERT INTO tenant_subjects (tenant_id, subject_id, is_enabled) VALUES (3, ?1, 0)",
                params![id],
            )
            .unwrap();

        assert!(store.permitted_patterns(3, Role::User).unwrap().is_empty());
    }

    #[test]
    fn test_allowed_recipients_are_normalized() {
        let store = store();
        store
            .connection()
            .unwrap()
            .execute(
                "INSERT INTO tenant_permissions (tenant_id, allowed_recipients) VALUES (4, ?1)",
                params![" Alice@Example.com, bob@example.com,,alice@example.com "],
            )
            .unwrap();

        assert_eq!(
            store.allowed_recipients(4).unwrap(),
            vec!["alice@example.com".to_string(), "bob@example.com".to_string()]
        );
        assert!(store.allowed_recipients(5).unwrap().is_empty());
    }
}
