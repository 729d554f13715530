//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_err() {
            // Fallback to the crate root so `cargo run` from a subdirectory works.
            let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
            let _ = dotenv::from_filename(candidate);
        }
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    init_env();
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Destination URL: MIGRATION_DB_URL, then DATABASE_URL.
pub fn db_url() -> Option<String> {
    ["MIGRATION_DB_URL", "DATABASE_URL"]
        .into_iter()
        .find_map(env_opt)
}

fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("KEY") || k.contains("TOKEN")
    {
        return "***".to_string();
    }
    let val_trim = val.trim();
    if let Ok(mut u) = url::Url::parse(val_trim) {
        if u.password().is_some() {
            let _ = u.set_password(Some("***"));
        }
        if !u.username().is_empty() {
            let _ = u.set_username("***");
        }
        return u.to_string();
    }
    val_trim.to_string()
}

/// Log a consolidated, redacted snapshot of the given env keys.
pub fn log_snapshot(title: &str, keys: &[&str]) {
    let snapshot: Vec<(String, String)> = keys
        .iter()
        .filter_map(|&k| env_opt(k).map(|v| (k.to_string(), redact_value(k, &v))))
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
}
