use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::identity::{file_tiebreaker, title_fingerprint, TestIdentity};
use crate::storage::StoreError;

/// Signature of the title hashing function. Swappable so collision handling
/// can be exercised.
pub type FingerprintFn = fn(&str) -> String;

/// Outcome of resolving one raw (title, file) pair.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub identity: TestIdentity,
    pub is_new: bool,
    /// Previous file path when the test was found in a different file.
    pub moved_from: Option<String>,
}

/// Maps canonical titles to [`TestIdentity`] values, persisting new
/// identities through the caller's connection (normally an open ingest
/// transaction).
///
/// The in-memory cache is only fed through [`IdentityResolver::remember`]
/// after the enclosing transaction commits, so a rolled-back run never
/// leaves phantom identities behind.
pub struct IdentityResolver {
    cache: RwLock<HashMap<String, TestIdentity>>,
    fingerprint: FingerprintFn,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::with_fingerprint_fn(title_fingerprint)
    }

    pub fn with_fingerprint_fn(fingerprint: FingerprintFn) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            fingerprint,
        }
    }

    /// Resolve `title` (already canonical) seen in `file` during run `run_seq`.
    pub fn resolve(
        &self,
        conn: &Connection,
        title: &str,
        file: &str,
        run_seq: i64,
        seen_at: &str,
    ) -> Result<Resolved, StoreError> {
        let cached = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(title).cloned());

        if let Some(identity) = cached {
            if let Some(resolved) = touch(conn, identity, file, run_seq, seen_at)? {
                return Ok(resolved);
            }
            // Retired by another writer since it was cached.
            debug!(%title, "cached identity no longer stored, resolving again");
            self.evict(title);
        }

        if let Some(identity) = self.find_by_title(conn, title)? {
            if let Some(resolved) = touch(conn, identity, file, run_seq, seen_at)? {
                return Ok(resolved);
            }
        }

        let fingerprint = (self.fingerprint)(title);
        let collides: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM identities WHERE fingerprint = ?1)",
                params![fingerprint],
                |row| row.get(0),
            )?;

        // Distinct titles sharing a fingerprint are told apart by the file
        // they were first seen in.
        let id = if collides {
            let id = format!("{}~{}", fingerprint, file_tiebreaker(file));
            debug!(%fingerprint, %id, %title, "fingerprint collision, disambiguating by file");
            id
        } else {
            fingerprint.clone()
        };

        conn.execute(
            "INSERT INTO identities
                (id, fingerprint, title, first_file, last_file, first_seen_at, last_seen_at, last_seen_seq)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?5, ?6)",
            params![id, fingerprint, title, file, seen_at, run_seq],
        )?;

        Ok(Resolved {
            identity: TestIdentity {
                id,
                fingerprint,
                title: title.to_string(),
                first_file: file.to_string(),
                last_file: file.to_string(),
            },
            is_new: true,
            moved_from: None,
        })
    }

    /// Record identities whose transaction has committed.
    pub fn remember<I: IntoIterator<Item = TestIdentity>>(&self, identities: I) {
        if let Ok(mut cache) = self.cache.write() {
            for identity in identities {
                cache.insert(identity.title.clone(), identity);
            }
        }
    }

    /// Drop retired identities from the cache.
    pub fn forget(&self, ids: &[String]) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, identity| !ids.contains(&identity.id));
        }
    }

    fn evict(&self, title: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(title);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn find_by_title(
        &self,
        conn: &Connection,
        title: &str,
    ) -> Result<Option<TestIdentity>, StoreError> {
        let fingerprint = (self.fingerprint)(title);
        let found = conn
            .query_row(
                "SELECT id, fingerprint, title, first_file, last_file FROM identities
                 WHERE fingerprint = ?1 AND title = ?2",
                params![fingerprint, title],
                |row| {
                    Ok(TestIdentity {
                        id: row.get(0)?,
                        fingerprint: row.get(1)?,
                        title: row.get(2)?,
                        first_file: row.get(3)?,
                        last_file: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }
}

/// Stamp an existing identity with this sighting. `None` when its row is
/// gone.
fn touch(
    conn: &Connection,
    mut identity: TestIdentity,
    file: &str,
    run_seq: i64,
    seen_at: &str,
) -> Result<Option<Resolved>, StoreError> {
    let moved_from = if !file.is_empty() && identity.last_file != file {
        Some(std::mem::replace(&mut identity.last_file, file.to_string()))
    } else {
        None
    };

    let updated = conn.execute(
        "UPDATE identities SET last_file = ?1, last_seen_seq = ?2, last_seen_at = ?3
         WHERE id = ?4",
        params![identity.last_file, run_seq, seen_at, identity.id],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    if let Some(from) = &moved_from {
        debug!(
            identity = %identity.id,
            from = %from,
            to = %file,
            "test observed in a new file"
        );
    }
    Ok(Some(Resolved {
        identity,
        is_new: false,
        moved_from,
    }))
}

/// Load one identity by key.
pub fn load_identity(conn: &Connection, id: &str) -> Result<Option<TestIdentity>, StoreError> {
    let found = conn
        .query_row(
            "SELECT id, fingerprint, title, first_file, last_file FROM identities WHERE id = ?1",
            params![id],
            |row| {
                Ok(TestIdentity {
                    id: row.get(0)?,
                    fingerprint: row.get(1)?,
                    title: row.get(2)?,
                    first_file: row.get(3)?,
                    last_file: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}
