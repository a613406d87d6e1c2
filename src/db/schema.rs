//! Local database schema, applied in order by `PRAGMA user_version`.

/// Each entry upgrades the schema from version `index` to `index + 1`.
pub const MIGRATIONS: &[&str] = &[
  r#"
-- Cache-first read results, one row per namespaced key
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    ttl_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_cache_stored_at ON cache(stored_at);

-- Offline mutation ledger; rows are kept after replay for audit
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_kind TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_pending ON sync_queue(synced, id);
"#,
  r#"
-- Mutations the server refused for good are set aside instead of blocking replay
ALTER TABLE sync_queue ADD COLUMN failed_at INTEGER;
ALTER TABLE sync_queue ADD COLUMN last_error TEXT;

CREATE INDEX IF NOT EXISTS idx_sync_queue_target ON sync_queue(resource_kind, resource_id);
"#,
];

/// Schema version after all migrations have run.
pub fn latest_version() -> i64 {
  MIGRATIONS.len() as i64
}
