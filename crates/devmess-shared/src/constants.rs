/// Application name
pub const APP_NAME: &str = "devmess";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

// -- Delivery hub --

/// Capacity of each connected client's outbound frame queue
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Largest inbound frame accepted on a realtime connection, in bytes
pub const MAX_FRAME_SIZE: usize = 512;

/// Time allowed to write a single frame to the peer
pub const WRITE_WAIT_SECS: u64 = 10;

/// Time allowed to read the next frame (or pong) from the peer
pub const PONG_WAIT_SECS: u64 = 60;

/// Interval between control pings; must be shorter than `PONG_WAIT_SECS`
pub const PING_PERIOD_SECS: u64 = (PONG_WAIT_SECS * 9) / 10;

/// Minimum gap between two presence writes caused by inbound traffic
pub const PRESENCE_THROTTLE_SECS: u64 = 10;

/// How often the hub prunes throttle bookkeeping for disconnected users
pub const HUB_HOUSEKEEPING_SECS: u64 = 300;

// -- Cache --

/// Lifetime of the `online:<user_id>` presence key
pub const PRESENCE_TTL_SECS: u64 = 300;

/// Lifetime of cached participant lists
pub const PARTICIPANTS_CACHE_TTL_SECS: u64 = 3600;

/// Lifetime of cached direct-conversation lookups
pub const CONVERSATION_CACHE_TTL_SECS: u64 = 3600;

/// Default deadline for a single cache round trip
pub const CACHE_OP_TIMEOUT_SECS: u64 = 5;

// -- Credentials --

/// Access tokens minted at sign-in (24 hours)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Refresh tokens (14 days)
pub const REFRESH_TOKEN_TTL_SECS: i64 = 14 * 24 * 60 * 60;

/// Access tokens minted by a local refresh (1 hour)
pub const REFRESHED_ACCESS_TTL_SECS: i64 = 60 * 60;

/// Password-reset links (15 minutes)
pub const RESET_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Shortest password accepted at registration or reset
pub const MIN_PASSWORD_LEN: usize = 6;

// -- Pagination --

pub const DEFAULT_CONVERSATION_PAGE: u32 = 20;
pub const DEFAULT_MESSAGE_PAGE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// System message inserted when a direct conversation is opened
pub const DIRECT_GREETING: &str = "This is a private conversation, say hello!";
