//! Configuration module for the catalog backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::TagCase;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key guarding admin routes (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Tag comparison policy shared by tag input and collection matching
    pub tag_case: TagCase,
    /// How long a first delete press stays armed
    pub delete_confirm_window: Duration,
}

const DEFAULT_DELETE_CONFIRM_MS: u64 = 3000;
/// Longest accepted delete window: one day.
const MAX_DELETE_CONFIRM_MS: u64 = 86_400_000;

/// Parse a delete window in milliseconds, accepting `1..=MAX_DELETE_CONFIRM_MS`.
fn parse_delete_confirm_ms(raw: &str) -> Option<u64> {
    raw.trim()
        .parse()
        .ok()
        .filter(|ms| (1..=MAX_DELETE_CONFIRM_MS).contains(ms))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let api_psk = env::var("CATALOG_API_PSK")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let db_path = env::var("CATALOG_DB_PATH")
            .unwrap_or_else(|_| "./data/catalog.sqlite".to_string())
            .into();

        let bind_addr = env::var("CATALOG_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .expect("Invalid CATALOG_BIND_ADDR format");

        let log_level = env::var("CATALOG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_format = match env::var("CATALOG_LOG_FORMAT") {
            Ok(raw) => LogFormat::parse(&raw).unwrap_or_else(|| {
                eprintln!("Unknown CATALOG_LOG_FORMAT {:?}, using text", raw);
                LogFormat::Text
            }),
            Err(_) => LogFormat::Text,
        };

        // Logging is not initialised yet, so fallbacks are reported on stderr.
        let tag_case = match env::var("CATALOG_TAG_CASE") {
            Ok(raw) => TagCase::parse(&raw).unwrap_or_else(|| {
                eprintln!("Unknown CATALOG_TAG_CASE {:?}, using sensitive", raw);
                TagCase::Sensitive
            }),
            Err(_) => TagCase::Sensitive,
        };

        let delete_confirm_ms = match env::var("CATALOG_DELETE_CONFIRM_MS") {
            Ok(raw) => parse_delete_confirm_ms(&raw).unwrap_or_else(|| {
                eprintln!(
                    "Invalid CATALOG_DELETE_CONFIRM_MS {:?} (expected 1..={}), using {}",
                    raw, MAX_DELETE_CONFIRM_MS, DEFAULT_DELETE_CONFIRM_MS
                );
                DEFAULT_DELETE_CONFIRM_MS
            }),
            Err(_) => DEFAULT_DELETE_CONFIRM_MS,
        };

        Self {
            api_psk,
            db_path,
            bind_addr,
            log_level,
            log_format,
            tag_case,
            delete_confirm_window: Duration::from_millis(delete_confirm_ms),
        }
    }
}
