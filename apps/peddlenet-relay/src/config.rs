use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Connections silent for longer than this are force-disconnected.
    pub heartbeat_timeout_seconds: u64,
    /// How often the background sweepers run.
    pub sweep_interval_seconds: u64,
    /// Empty rooms idle for longer than this have their message buffers
    /// reclaimed. Historical room records are kept.
    pub room_stale_seconds: u64,
    /// How long a forwarded connection request may wait for a response.
    pub signaling_timeout_seconds: u64,
    /// Per-room cap on buffered messages.
    pub message_history_cap: usize,
    pub admin_username: String,
    pub admin_password: String,
    /// Optional SQLite URL; when set, messages are written through to disk.
    pub database_url: Option<String>,
    pub shutdown_grace_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PEDDLENET_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            heartbeat_timeout_seconds: env::var("PEDDLENET_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            sweep_interval_seconds: env::var("PEDDLENET_SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            room_stale_seconds: env::var("PEDDLENET_ROOM_STALE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            signaling_timeout_seconds: env::var("PEDDLENET_SIGNALING_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            message_history_cap: env::var("PEDDLENET_MESSAGE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|cap: usize| cap.min(500))
                .unwrap_or(100),
            admin_username: env::var("PEDDLENET_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
            admin_password: env::var("PEDDLENET_ADMIN_PASSWORD")
                .unwrap_or_else(|_| "peddlenet".into()),
            database_url: env::var("PEDDLENET_DATABASE_URL").ok(),
            shutdown_grace_seconds: env::var("PEDDLENET_SHUTDOWN_GRACE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            heartbeat_timeout_seconds: 90,
            sweep_interval_seconds: 300,
            room_stale_seconds: 3600,
            signaling_timeout_seconds: 30,
            message_history_cap: 100,
            admin_username: "admin".to_string(),
            admin_password: "peddlenet".to_string(),
            database_url: None,
            shutdown_grace_seconds: 5,
        }
    }
}
