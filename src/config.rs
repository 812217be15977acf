use std::env;

pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    /// Shared secret required on admin endpoints via the X-Admin-Token header.
    pub admin_token: String,
    /// Plaintext starter password assigned to accounts provisioned from
    /// webhooks. Members are told to change it after first login.
    pub default_member_password: String,
    /// How long a downgraded member keeps premium after a terminal event.
    /// Zero downgrades immediately.
    pub grace_hours_after_expiration: i64,
    pub retry_max_attempts: i32,
    pub retry_backoff_base_secs: i64,
    pub retry_poll_interval_secs: u64,
    /// Hard ceiling on inline webhook processing before the provider gets
    /// its acknowledgment anyway.
    pub handler_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let frontend_origin = env::var("FRONTEND_ORIGIN").expect("FRONTEND_ORIGIN must be set");

        let admin_token = env::var("ADMIN_TOKEN").expect("ADMIN_TOKEN must be set");

        let default_member_password =
            env::var("DEFAULT_MEMBER_PASSWORD").unwrap_or_else(|_| "mudar@123".to_string());

        Config {
            database_url,
            frontend_origin,
            admin_token,
            default_member_password,
            grace_hours_after_expiration: parsed_env("GRACE_HOURS_AFTER_EXPIRATION", 0),
            retry_max_attempts: parsed_env("RETRY_MAX_ATTEMPTS", 5),
            retry_backoff_base_secs: parsed_env("RETRY_BACKOFF_BASE_SECS", 60),
            retry_poll_interval_secs: parsed_env("RETRY_POLL_INTERVAL_SECS", 30),
            handler_timeout_secs: parsed_env("HANDLER_TIMEOUT_SECS", 10),
        }
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
