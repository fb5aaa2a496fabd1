//! v001 -- Initial schema creation.
//!
//! Creates the seven core tables: `users`, `devices`, `tokens`,
//! `friendships`, `conversations`, `participants` and `messages`.
//!
//! Timestamps are fixed-width RFC 3339 UTC strings with millisecond
//! precision (`2024-05-01T09:30:00.123Z`), so lexical order is time order.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name          TEXT NOT NULL,
    email         TEXT NOT NULL UNIQUE,        -- lowercased
    password_hash TEXT,                        -- PHC string, local accounts only
    avatar        TEXT NOT NULL DEFAULT '',
    provider      TEXT NOT NULL,               -- local | google
    status        TEXT NOT NULL DEFAULT 'offline',
    last_seen     TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    deleted_at    TEXT,                        -- soft delete

    CHECK ((provider = 'local') = (password_hash IS NOT NULL))
);

-- ----------------------------------------------------------------
-- Devices
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    id          TEXT PRIMARY KEY NOT NULL,
    user_id     TEXT NOT NULL,
    type        TEXT NOT NULL,                 -- Android | iOS | Web
    name        TEXT NOT NULL,                 -- browser family
    ip          TEXT NOT NULL,
    user_agent  TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    UNIQUE (user_id, ip, user_agent),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Tokens (one per device)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS tokens (
    id            TEXT PRIMARY KEY NOT NULL,
    device_id     TEXT NOT NULL UNIQUE,
    access_token  TEXT NOT NULL UNIQUE,
    refresh_token TEXT UNIQUE,
    expires_at    INTEGER NOT NULL,            -- epoch seconds
    token_type    TEXT NOT NULL,               -- provider string
    created_at    TEXT NOT NULL,

    FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Friendships (pair stored canonically: user_id < friend_id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    id           TEXT PRIMARY KEY NOT NULL,
    user_id      TEXT NOT NULL,
    friend_id    TEXT NOT NULL,
    requested_by TEXT NOT NULL,
    status       TEXT NOT NULL,                -- pending | friend | no_friend | blocked
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    UNIQUE (user_id, friend_id),
    CHECK (user_id < friend_id),
    CHECK (requested_by IN (user_id, friend_id)),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_friendships_friend ON friendships(friend_id);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,
    type            TEXT NOT NULL,             -- direct | group
    name            TEXT,
    last_message_id TEXT,                      -- soft FK -> messages(id)
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL              -- cursor key
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC, id DESC);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL DEFAULT 'member',
    last_read_at    TEXT,
    joined_at       TEXT NOT NULL,

    UNIQUE (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT,                      -- NULL for system messages
    content         TEXT NOT NULL,
    type            TEXT NOT NULL,             -- text | image | file | video | system
    status          TEXT NOT NULL,             -- sent | delivered | read
    is_edited       INTEGER NOT NULL DEFAULT 0,
    reply_to_id     TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,             -- ordering key
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
