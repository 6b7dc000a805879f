/// Schema for the offline store.
///
/// `queue_stats.pending` is maintained by triggers so the pending count never
/// needs a table scan.
pub const SCHEMA: &str = r#"
-- Pending mutations, replayed in id order
CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    collection TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    sync_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_pending
    ON offline_queue(id) WHERE synced = 0;

CREATE TABLE IF NOT EXISTS queue_stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pending INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO queue_stats (id, pending) VALUES (1, 0);

CREATE TRIGGER IF NOT EXISTS trg_offline_queue_insert
AFTER INSERT ON offline_queue WHEN NEW.synced = 0
BEGIN
    UPDATE queue_stats SET pending = pending + 1 WHERE id = 1;
END;

CREATE TRIGGER IF NOT EXISTS trg_offline_queue_synced
AFTER UPDATE OF synced ON offline_queue WHEN OLD.synced = 0 AND NEW.synced = 1
BEGIN
    UPDATE queue_stats SET pending = pending - 1 WHERE id = 1;
END;

CREATE TRIGGER IF NOT EXISTS trg_offline_queue_delete
AFTER DELETE ON offline_queue WHEN OLD.synced = 0
BEGIN
    UPDATE queue_stats SET pending = pending - 1 WHERE id = 1;
END;

-- Photo attachments waiting for upload
CREATE TABLE IF NOT EXISTS offline_photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    blob BLOB NOT NULL,
    content_type TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    uploaded INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    uploaded_at TEXT
);

-- Items abandoned by the sync engine, kept for diagnostics
CREATE TABLE IF NOT EXISTS dead_letter (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    item_id INTEGER NOT NULL,
    collection TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    failed_at TEXT NOT NULL
);

-- Last authenticated identity, keyed 'current-user'
CREATE TABLE IF NOT EXISTS user_profile (
    key TEXT PRIMARY KEY,
    uid TEXT NOT NULL,
    email TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    client TEXT,
    unit TEXT,
    saved_at TEXT NOT NULL
);
"#;
