//! PostgREST-style HTTP remote.
//!
//! Each table is a resource at `{base_url}/{table}`. Filters render as query
//! parameters of the form `field=op.value`; writes ask for the stored rows
//! back with `Prefer: return=representation`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use replica_core::{Condition, Filter, Key, Row, TableInfo, Value};
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::config::RestConfig;
use crate::traits::{RemoteSource, RemoteTable};

const RETURN_ROWS: &str = "return=representation";
const MERGE_ROWS: &str = "resolution=merge-duplicates,return=representation";

#[derive(Debug, Clone)]
pub struct RestRemote {
    client: Client,
    config: Arc<RestConfig>,
}

impl RestRemote {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

impl RemoteSource for RestRemote {
    fn table(&self, info: &TableInfo) -> Arc<dyn RemoteTable> {
        Arc::new(RestTable {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            table: info.name.clone(),
            primary_key: info.primary_key.clone(),
        })
    }
}

#[derive(Debug)]
struct RestTable {
    client: Client,
    config: Arc<RestConfig>,
    table: String,
    primary_key: String,
}

impl RestTable {
    fn url(&self) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), self.table)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.header("apikey", key).bearer_auth(key),
            None => req,
        }
    }

    fn key_param(&self, key: &Key) -> [(String, String); 1] {
        [(self.primary_key.clone(), format!("eq.{key}"))]
    }

    async fn rows(&self, req: RequestBuilder) -> anyhow::Result<Vec<Row>> {
        let response = self
            .authorized(req)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("request to `{}` failed", self.table))?;
        response
            .json::<Vec<Row>>()
            .await
            .with_context(|| format!("malformed rows from `{}`", self.table))
    }
}

#[async_trait]
impl RemoteTable for RestTable {
    async fn select(&self, filter: &Filter) -> anyhow::Result<Vec<Row>> {
        let params = render_filter(filter);
        debug!(table = %self.table, ?params, "remote select");
        self.rows(self.client.get(self.url()).query(&params)).await
    }

    async fn insert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        let req = self.client.post(self.url()).header("Prefer", RETURN_ROWS).json(&rows);
        self.rows(req).await
    }

    async fn update(&self, row: Row, key: &Key) -> anyhow::Result<Row> {
        let req = self
            .client
            .patch(self.url())
            .query(&self.key_param(key))
            .header("Prefer", RETURN_ROWS)
            .json(&row);
        self.rows(req)
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("no row {key} in `{}`", self.table))
    }

    async fn upsert(&self, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        let req = self.client.post(self.url()).header("Prefer", MERGE_ROWS).json(&rows);
        self.rows(req).await
    }

    async fn delete(&self, key: &Key) -> anyhow::Result<()> {
        let req = self.client.delete(self.url()).query(&self.key_param(key));
        self.authorized(req)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("delete of {key} in `{}` failed", self.table))?;
        Ok(())
    }
}

/// Query parameters for `filter`, one per condition.
#[must_use]
pub fn render_filter(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|c| {
            let rendered = match c.condition() {
                Condition::Eq(v) => format!("eq.{}", render_value(v)),
                Condition::Not(v) => format!("neq.{}", render_value(v)),
                Condition::Gt(v) => format!("gt.{}", render_value(v)),
                Condition::Lt(v) => format!("lt.{}", render_value(v)),
                Condition::In(values) => {
                    let items: Vec<String> = values.iter().map(render_list_item).collect();
                    format!("in.({})", items.join(","))
                }
            };
            (c.field().to_string(), rendered)
        })
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Map(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// List items are quoted when they contain reserved characters.
fn render_list_item(value: &Value) -> String {
    match value {
        Value::String(s) if s.contains([',', '(', ')', '"', ' ']) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        other => render_value(other),
    }
}
