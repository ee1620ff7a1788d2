pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MESSAGES_PER_APPLICATION: usize = 100;
pub const DEFAULT_CACHE_LIMIT: usize = 2000;
pub const MAX_API_PAGE_LIMIT: usize = 200;
pub const MAX_CACHE_LIMIT: usize = 20_000;

pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const STREAM_LIVENESS_CHECK_INTERVAL_SECS: u64 = 15;
pub const STREAM_LIVENESS_IDLE_SECS: u64 = 90;
pub const STREAM_LIVENESS_PING_GRACE_SECS: u64 = 30;

pub const RECONNECT_BACKOFF_INITIAL_SECS: u64 = 1;
pub const RECONNECT_BACKOFF_MAX_SECS: u64 = 30;
pub const RECONNECT_JITTER_MAX_MS: u64 = 500;

pub const AUTH_HEADER: &str = "X-Gotify-Key";
pub const SETTINGS_ENV: &str = "GOTIFY_TRAY_SETTINGS";
pub const SETTINGS_DIR_NAME: &str = "gotify-tray";
