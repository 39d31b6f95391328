/// Huddle API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to verify HS256 credential tokens.
    pub jwt_secret: String,
    /// Expected `iss` claim. Tokens from any issuer are accepted when unset.
    pub jwt_issuer: Option<String>,
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Number of messages retained per room.
    pub history_capacity: usize,
    /// Bound of each session's outbound delivery queue.
    pub session_queue_capacity: usize,
    /// Maximum message length in characters, measured after trimming.
    pub max_message_length: usize,
}

pub const DEFAULT_PORT: u16 = 4010;
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4000;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            jwt_issuer: std::env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            port: parsed_var("PORT").unwrap_or(DEFAULT_PORT),
            history_capacity: parsed_var("HISTORY_CAPACITY")
                .unwrap_or(DEFAULT_HISTORY_CAPACITY)
                .max(1),
            session_queue_capacity: parsed_var("SESSION_QUEUE_CAPACITY")
                .unwrap_or(DEFAULT_SESSION_QUEUE_CAPACITY)
                .max(1),
            max_message_length: parsed_var("MAX_MESSAGE_LENGTH")
                .unwrap_or(DEFAULT_MAX_MESSAGE_LENGTH),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
