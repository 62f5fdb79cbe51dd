/// Schema for the local store.
pub const SCHEMA: &str = r#"
-- Entities of every type, serialized as JSON.
-- AUTOINCREMENT keeps local ids from ever being reused after a delete.
CREATE TABLE IF NOT EXISTS entities (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    stable_key TEXT NOT NULL,
    pending_action INTEGER NOT NULL DEFAULT 0,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (entity_type, stable_key)
);

CREATE INDEX IF NOT EXISTS idx_entities_pending
    ON entities(entity_type, pending_action);

-- Last successful remote request per (request kind, entity)
CREATE TABLE IF NOT EXISTS last_requests (
    request TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    PRIMARY KEY (request, entity_id)
);
"#;
