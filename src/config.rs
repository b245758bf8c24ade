use std::env;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub engine_host: String,
    pub http_addr: String,
    pub telegram_enabled: bool,
    pub telegram_token: String,
    pub telegram_chat_id: String,
    pub restart_window_seconds: u64,
    pub restart_threshold: usize,
    pub ws_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./healthmon.db".to_string(),
            engine_host: "unix:///var/run/docker.sock".to_string(),
            http_addr: ":8080".to_string(),
            telegram_enabled: false,
            telegram_token: String::new(),
            telegram_chat_id: String::new(),
            restart_window_seconds: 300,
            restart_threshold: 3,
            ws_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Config::default();
        Self {
            db_path: get_env("DB_PATH", &defaults.db_path),
            engine_host: get_env("ENGINE_HOST", &defaults.engine_host),
            http_addr: get_env("HTTP_ADDR", &defaults.http_addr),
            telegram_enabled: parse_bool(
                &env::var("TG_ENABLED").unwrap_or_default(),
                defaults.telegram_enabled,
            ),
            telegram_token: env::var("TG_TOKEN").unwrap_or_default(),
            telegram_chat_id: env::var("TG_CHAT_ID").unwrap_or_default(),
            restart_window_seconds: parse_int(
                &env::var("RESTART_WINDOW_SECONDS").unwrap_or_default(),
                defaults.restart_window_seconds,
            ),
            restart_threshold: parse_int(
                &env::var("RESTART_THRESHOLD").unwrap_or_default(),
                defaults.restart_threshold,
            ),
            ws_origins: parse_csv(&env::var("WS_ORIGINS").unwrap_or_default()),
        }
    }

    /// Listen address for the HTTP server. A bare `:port` binds all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

fn get_env(key: &str, def: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => def.to_string(),
    }
}

fn parse_bool(val: &str, def: bool) -> bool {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => def,
    }
}

fn parse_int<T: std::str::FromStr + Copy>(val: &str, def: T) -> T {
    val.trim().parse().unwrap_or(def)
}

fn parse_csv(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
