//! Run configuration: env defaults, overridden by CLI flags.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::index::CollisionPolicy;
use crate::normalization::phone::DEFAULT_COUNTRY_CODE;
use crate::util::env::{db_url, env_flag, env_opt, env_parse, env_parse_opt};

pub const DEFAULT_SOURCE_DIR: &str = "./export";
pub const DEFAULT_DB_URL: &str = "sqlite://migration.db";
pub const DEFAULT_CHECKPOINT: &str = "migration_checkpoint.json";
pub const DEFAULT_TOLERANCE: u64 = 5;

/// Remote paginated source, used instead of CSV sheets when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub timeout: Duration,
}

impl ApiSourceConfig {
    pub fn from_env() -> Option<Self> {
        let base_url = env_opt("SOURCE_API_URL")?;
        Some(Self {
            base_url,
            api_key: env_opt("SOURCE_API_KEY"),
            page_size: env_parse("SOURCE_API_PAGE_SIZE", 100),
            max_pages: env_parse("SOURCE_API_MAX_PAGES", 1000),
            timeout: Duration::from_secs(env_parse("SOURCE_API_TIMEOUT_SECS", 30)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory of CSV sheets, or a single sheet file for the phase being run.
    pub source: PathBuf,
    pub api: Option<ApiSourceConfig>,
    pub db_url: String,
    pub checkpoint: PathBuf,
    pub dry_run: bool,
    /// Run a phase even when its dependencies are not completed.
    pub force: bool,
    pub limit: Option<usize>,
    /// Entities per write transaction; 0 commits the whole phase at once.
    pub batch_size: usize,
    pub write_timeout: Duration,
    pub country_code: String,
    pub default_tolerance: u64,
    /// Per validation target, keyed by target name (`patient`, `referral`, ...).
    pub tolerances: HashMap<String, u64>,
    pub collision_policy: CollisionPolicy,
    pub max_recorded_errors: usize,
    pub progress_interval: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from(DEFAULT_SOURCE_DIR),
            api: None,
            db_url: DEFAULT_DB_URL.to_string(),
            checkpoint: PathBuf::from(DEFAULT_CHECKPOINT),
            dry_run: false,
            force: false,
            limit: None,
            batch_size: 0,
            write_timeout: Duration::from_secs(120),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            default_tolerance: DEFAULT_TOLERANCE,
            tolerances: HashMap::new(),
            collision_policy: CollisionPolicy::default(),
            max_recorded_errors: 100,
            progress_interval: 500,
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let tolerances = crate::validate::TARGETS
            .iter()
            .filter_map(|target| {
                let key = format!("VALIDATION_TOLERANCE_{}", target.name.to_ascii_uppercase());
                env_parse_opt::<u64>(&key).map(|t| (target.name.to_string(), t))
            })
            .collect();
        Self {
            source: env_opt("MIGRATION_SOURCE")
                .map(PathBuf::from)
                .unwrap_or(defaults.source),
            api: ApiSourceConfig::from_env(),
            db_url: db_url().unwrap_or(defaults.db_url),
            checkpoint: env_opt("MIGRATION_CHECKPOINT")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint),
            dry_run: env_flag("MIGRATION_DRY_RUN", false),
            force: env_flag("MIGRATION_FORCE", false),
            limit: env_parse_opt("MIGRATION_LIMIT"),
            batch_size: env_parse("MIGRATION_BATCH_SIZE", defaults.batch_size),
            write_timeout: Duration::from_secs(env_parse("MIGRATION_WRITE_TIMEOUT_SECS", 120)),
            country_code: env_opt("PHONE_COUNTRY_CODE").unwrap_or(defaults.country_code),
            default_tolerance: env_parse("VALIDATION_TOLERANCE", defaults.default_tolerance),
            tolerances,
            collision_policy: env_parse("MIGRATION_COLLISION_POLICY", defaults.collision_policy),
            max_recorded_errors: env_parse("MIGRATION_MAX_RECORDED_ERRORS", defaults.max_recorded_errors),
            progress_interval: env_parse("MIGRATION_PROGRESS_INTERVAL", defaults.progress_interval),
        }
    }

    pub fn tolerance_for(&self, target: &str) -> u64 {
        self.tolerances
            .get(target)
            .copied()
            .unwrap_or(self.default_tolerance)
    }
}
