//! ClickHouse over its HTTP interface.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error, warn};

use super::AnalyticSink;
use crate::error::SinkError;
use crate::schema::{value, Row};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ClickHouseAdapter {
    client: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseAdapter {
    pub fn new(url: &str, database: &str) -> Result<Self, SinkError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(ClickHouseAdapter {
            client,
            url: url.trim_end_matches('/').to_owned(),
            database: database.to_owned(),
            user: None,
            password: None,
        })
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    async fn send(&self, sql: String) -> Result<String, SinkError> {
        let mut req = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("database", self.database.as_str())])
            .body(sql);
        if let Some(user) = &self.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body: body.trim().to_owned(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl AnalyticSink for ClickHouseAdapter {
    async fn execute(&self, statement: &str, rows: &[Row]) -> Result<(), SinkError> {
        let sql = if rows.is_empty() {
            statement.to_owned()
        } else {
            value::insert_values(statement, rows)
        };
        let head = statement.trim().lines().next().unwrap_or_default();
        match self.send(sql).await {
            Ok(_) => {
                debug!(statement = head, rows = rows.len(), "statement executed");
                Ok(())
            }
            Err(e) => {
                error!(statement = head, rows = rows.len(), error = %e, "executing statement");
                Err(e)
            }
        }
    }

    async fn fetch(&self, query: &str) -> Option<Vec<serde_json::Value>> {
        let body = match self.send(format!("{} FORMAT JSONEachRow", query.trim())).await {
            Ok(body) => body,
            Err(e) => {
                warn!(query, error = %e, "fetch failed");
                return None;
            }
        };
        let mut rows = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(query, error = %e, "undecodable row in fetch result");
                    return None;
                }
            }
        }
        Some(rows)
    }
}
