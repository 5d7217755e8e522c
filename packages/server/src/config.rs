use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// TLS posture for the database connection.
///
/// Production deployments must not run with `Disable`, and `Require` without
/// a CA certificate is rejected there as well (silent MitM exposure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbSslMode {
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl DbSslMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => bail!("invalid DB_SSL_MODE: {other}. Use: disable, require, verify-ca, verify-full"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub environment: String,

    // Database TLS posture
    pub db_ssl_mode: DbSslMode,
    pub db_ssl_ca_cert_path: Option<String>,

    // Job processing
    pub max_jobs_per_batch: i64,
    pub job_timeout_seconds: u64,
    pub backoff_base_seconds: i64,
    pub webhook_max_attempts: i32,

    // Zombie scanning
    pub zombie_plugin_timeout_seconds: u64,
    pub zombie_scan_deadline_seconds: u64,

    // Shared state / rate limiting
    pub redis_url: Option<String>,
    pub ratelimit_enabled: bool,

    // Secrets and collaborators
    pub internal_job_secret: String,
    pub jwt_secret: String,
    pub slack_bot_token: Option<String>,
    pub slack_channel_id: Option<String>,
    pub paystack_secret_key: Option<String>,
    pub llm_api_url: Option<String>,
    pub llm_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let db_ssl_mode = DbSslMode::parse(
            &env::var("DB_SSL_MODE").unwrap_or_else(|_| "require".to_string()),
        )?;
        let db_ssl_ca_cert_path = env::var("DB_SSL_CA_CERT_PATH").ok();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            environment,
            db_ssl_mode,
            db_ssl_ca_cert_path,
            max_jobs_per_batch: parse_or("MAX_JOBS_PER_BATCH", 10)?,
            job_timeout_seconds: parse_or("JOB_TIMEOUT_SECONDS", 300)?,
            backoff_base_seconds: parse_or("BACKOFF_BASE_SECONDS", 60)?,
            webhook_max_attempts: parse_or("WEBHOOK_MAX_ATTEMPTS", 5)?,
            zombie_plugin_timeout_seconds: parse_or("ZOMBIE_PLUGIN_TIMEOUT_SECONDS", 30)?,
            zombie_scan_deadline_seconds: parse_or("ZOMBIE_SCAN_DEADLINE_SECONDS", 300)?,
            redis_url: env::var("REDIS_URL").ok(),
            ratelimit_enabled: env::var("RATELIMIT_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            internal_job_secret: env::var("INTERNAL_JOB_SECRET")
                .unwrap_or_else(|_| "dev-secret".to_string()),
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            slack_bot_token: env::var("SLACK_BOT_TOKEN").ok(),
            slack_channel_id: env::var("SLACK_CHANNEL_ID").ok(),
            paystack_secret_key: env::var("PAYSTACK_SECRET_KEY").ok(),
            llm_api_url: env::var("LLM_API_URL").ok(),
            llm_api_key: env::var("LLM_API_KEY").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "staging")
    }

    /// Reject TLS postures that are unacceptable outside local development.
    fn validate(&self) -> Result<()> {
        if self.is_production() {
            match self.db_ssl_mode {
                DbSslMode::Disable => {
                    bail!("DB_SSL_MODE=disable is not allowed in {}", self.environment)
                }
                DbSslMode::Require if self.db_ssl_ca_cert_path.is_none() => {
                    bail!("DB_SSL_CA_CERT_PATH is mandatory when DB_SSL_MODE=require in production")
                }
                _ => {}
            }
        }
        if matches!(self.db_ssl_mode, DbSslMode::VerifyCa | DbSslMode::VerifyFull)
            && self.db_ssl_ca_cert_path.is_none()
        {
            bail!(
                "DB_SSL_CA_CERT_PATH required for DB_SSL_MODE={}",
                self.db_ssl_mode.as_str()
            );
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: DbSslMode, environment: &str) -> Config {
        Config {
            database_url: "postgres://localhost/skysweep".to_string(),
            port: 8080,
            environment: environment.to_string(),
            db_ssl_mode: mode,
            db_ssl_ca_cert_path: None,
            max_jobs_per_batch: 10,
            job_timeout_seconds: 300,
            backoff_base_seconds: 60,
            webhook_max_attempts: 5,
            zombie_plugin_timeout_seconds: 30,
            zombie_scan_deadline_seconds: 300,
            redis_url: None,
            ratelimit_enabled: true,
            internal_job_secret: "dev-secret".to_string(),
            jwt_secret: "test".to_string(),
            slack_bot_token: None,
            slack_channel_id: None,
            paystack_secret_key: None,
            llm_api_url: None,
            llm_api_key: None,
        }
    }

    #[test]
    fn ssl_mode_parses_all_variants() {
        assert_eq!(DbSslMode::parse("disable").unwrap(), DbSslMode::Disable);
        assert_eq!(DbSslMode::parse("REQUIRE").unwrap(), DbSslMode::Require);
        assert_eq!(DbSslMode::parse("verify-ca").unwrap(), DbSslMode::VerifyCa);
        assert_eq!(DbSslMode::parse("verify-full").unwrap(), DbSslMode::VerifyFull);
        assert!(DbSslMode::parse("yolo").is_err());
    }

    #[test]
    fn production_rejects_disabled_ssl() {
        let config = base_config(DbSslMode::Disable, "production");
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_rejects_unverified_require() {
        let config = base_config(DbSslMode::Require, "production");
        assert!(config.validate().is_err());

        let mut verified = base_config(DbSslMode::Require, "production");
        verified.db_ssl_ca_cert_path = Some("/etc/ssl/ca.pem".to_string());
        assert!(verified.validate().is_ok());
    }

    #[test]
    fn development_allows_disabled_ssl() {
        let config = base_config(DbSslMode::Disable, "development");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn verify_modes_need_ca_path_everywhere() {
        let config = base_config(DbSslMode::VerifyFull, "development");
        assert!(config.validate().is_err());
    }
}
