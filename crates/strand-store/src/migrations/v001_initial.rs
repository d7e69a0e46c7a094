//! v001 -- Initial schema creation.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Threads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS threads (
    id         TEXT PRIMARY KEY NOT NULL,   -- hex thread public key
    name       TEXT NOT NULL,
    secret     BLOB NOT NULL,               -- 32-byte thread secret key
    head       TEXT NOT NULL DEFAULT '',    -- content id, '' for genesis
    created_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Blocks (local index of applied thread blocks)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    id                 TEXT PRIMARY KEY NOT NULL,  -- content id
    thread_id          TEXT NOT NULL,
    author_id          TEXT NOT NULL,              -- hex pubkey
    block_type         TEXT NOT NULL,
    date               TEXT NOT NULL,
    parents            TEXT NOT NULL DEFAULT '',   -- comma separated
    target             TEXT,                       -- data / annotation / ignore target
    key_cipher         BLOB,
    body_cipher        BLOB,
    author_name_cipher BLOB,

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_blocks_thread_date ON blocks(thread_id, date DESC);
CREATE INDEX IF NOT EXISTS idx_blocks_target ON blocks(target);

-- ----------------------------------------------------------------
-- Thread peers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS thread_peers (
    id        TEXT NOT NULL,                -- hex peer pubkey
    thread_id TEXT NOT NULL,
    welcomed  INTEGER NOT NULL DEFAULT 0,
    added_at  TEXT NOT NULL,

    PRIMARY KEY (id, thread_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Pending invites (received, not yet accepted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS thread_invites (
    id        TEXT PRIMARY KEY NOT NULL,    -- invite block content id
    thread_id TEXT NOT NULL,
    name      TEXT NOT NULL,
    inviter   TEXT NOT NULL,
    date      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Outbound pointers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pointers (
    id            TEXT PRIMARY KEY NOT NULL,
    key           TEXT NOT NULL,             -- hex pointer key
    cid           TEXT NOT NULL,
    provider      TEXT NOT NULL,
    provider_addr TEXT,
    date          TEXT NOT NULL,
    cancel_id     TEXT
);

CREATE INDEX IF NOT EXISTS idx_pointers_date ON pointers(date);

-- ----------------------------------------------------------------
-- Inbound offline messages (delivery markers and deferred envelopes)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS offline_messages (
    addr     TEXT PRIMARY KEY NOT NULL,      -- content id the message came from
    date     TEXT NOT NULL,
    envelope BLOB                            -- NULL once delivered
);

-- ----------------------------------------------------------------
-- Cafe request queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_requests (
    id        TEXT PRIMARY KEY NOT NULL,     -- UUID v7, time ordered
    target_id TEXT NOT NULL,
    cafe_id   TEXT NOT NULL,
    type      TEXT NOT NULL,
    date      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cafe_requests_cafe ON cafe_requests(cafe_id);

-- ----------------------------------------------------------------
-- Cafe sessions (this node as a client)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_sessions (
    cafe_id TEXT PRIMARY KEY NOT NULL,
    access  TEXT NOT NULL,
    refresh TEXT NOT NULL,
    expiry  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Cafe clients (this node as a host)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_clients (
    id      TEXT PRIMARY KEY NOT NULL,
    access  TEXT NOT NULL UNIQUE,
    refresh TEXT NOT NULL UNIQUE,
    expiry  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cafe_client_threads (
    id            TEXT NOT NULL,             -- thread id
    client_id     TEXT NOT NULL,
    secret_cipher BLOB NOT NULL,
    head_cipher   BLOB NOT NULL,
    name_cipher   BLOB NOT NULL,
    updated_at    TEXT NOT NULL,

    PRIMARY KEY (id, client_id),
    FOREIGN KEY (client_id) REFERENCES cafe_clients(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Contacts (sender keys seen on inbound messages)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id        TEXT PRIMARY KEY NOT NULL,
    last_seen TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
