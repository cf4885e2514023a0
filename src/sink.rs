//! Column store access.
pub mod clickhouse;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::SinkError;
use crate::schema::{EventKind, Row};

/// Analytical store the ingester writes into.
///
/// Only [`execute`](AnalyticSink::execute) and [`fetch`](AnalyticSink::fetch) are
/// transport specific; table bootstrap and the health check are built on top of them.
#[async_trait]
pub trait AnalyticSink: Send + Sync {
    /// Runs `statement`. With rows, `statement` is an `INSERT ... VALUES` head and all
    /// rows go out in one round trip.
    async fn execute(&self, statement: &str, rows: &[Row]) -> Result<(), SinkError>;

    /// Best-effort read, `None` on any failure.
    async fn fetch(&self, query: &str) -> Option<Vec<serde_json::Value>>;

    /// Creates the destination tables if they are missing.
    async fn init(&self) -> Result<(), SinkError> {
        for kind in EventKind::ALL {
            match self.execute(kind.create_table(), &[]).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    error!(table = kind.table(), error = %e, "creating table");
                    return Err(e);
                }
            }
        }
        info!("destination tables are in place");
        Ok(())
    }

    /// Probes the store with a trivial read. Never fails, only reports.
    async fn health_check(&self) -> bool {
        match self.fetch("SELECT version() AS version").await {
            Some(rows) if !rows.is_empty() => {
                let version = rows[0].get("version").and_then(|v| v.as_str()).unwrap_or("?");
                info!(version, "column store is reachable");
                true
            }
            Some(_) => {
                error!("column store returned no rows for version query");
                false
            }
            None => {
                error!("column store is unreachable");
                false
            }
        }
    }
}
