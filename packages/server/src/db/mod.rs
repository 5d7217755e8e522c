//! Database pool construction and query observability.

pub mod session;

use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::warn;

use crate::common::metrics;
use crate::config::{Config, DbSslMode};

/// Statements slower than this are flagged.
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(200);

/// Build the connection pool with the configured TLS posture.
///
/// The unacceptable mode/environment combinations are rejected at config load;
/// this only maps the surviving mode onto the driver.
pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.database_url)
        .context("DATABASE_URL is not a valid Postgres URL")?;

    options = options.ssl_mode(match config.db_ssl_mode {
        DbSslMode::Disable => PgSslMode::Disable,
        DbSslMode::Require => PgSslMode::Require,
        DbSslMode::VerifyCa => PgSslMode::VerifyCa,
        DbSslMode::VerifyFull => PgSslMode::VerifyFull,
    });
    if let Some(ca) = &config.db_ssl_ca_cert_path {
        options = options.ssl_root_cert(ca);
    }

    if config.db_ssl_mode == DbSslMode::Disable {
        warn!("database_ssl_disabled: do not use outside local development");
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Time a database future and flag statements exceeding the slow threshold.
pub async fn observed<T, F>(statement: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let out = fut.await;
    let elapsed = started.elapsed();
    if elapsed > SLOW_QUERY_THRESHOLD {
        warn!(
            duration_ms = elapsed.as_millis() as u64,
            statement = statement_preview(statement),
            "slow_query_detected"
        );
        metrics::record_slow_query();
    }
    out
}

fn statement_preview(statement: &str) -> &str {
    let trimmed = statement.trim_start();
    &trimmed[..trimmed.len().min(120)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observed_passes_through_result() {
        let value = observed("SELECT 1", async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[test]
    fn statement_preview_truncates() {
        let long = "SELECT ".to_string() + &"x".repeat(500);
        assert_eq!(statement_preview(&long).len(), 120);
        assert_eq!(statement_preview("  SELECT 1"), "SELECT 1");
    }
}
