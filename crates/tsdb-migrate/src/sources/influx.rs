//! InfluxDB 1.x reader over the HTTP query API.
//!
//! Exploration lists every series matching the series filter; each series is
//! one read task covering all of its measurement's numeric fields. Reading a
//! task issues one chunked `SELECT` of those fields and turns every page of
//! the streamed response into a multi-column chunk.

use async_trait::async_trait;
use futures::stream;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::http::{connection_error, create_http_client, create_streaming_client, join_url};
use crate::model::{Chunk, Column, Label};
use crate::sources::{ChunkStream, SourceReader};

/// Label carrying the source database name.
pub const DATABASE_LABEL: &str = "db";

const NUMERIC_FIELD_TYPES: [&str; 4] = ["float", "integer", "unsigned", "boolean"];

/// Configuration for the InfluxDB source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// InfluxDB address, e.g. `http://localhost:8086`.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Optional username for Basic auth.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional password for Basic auth.
    #[serde(default)]
    pub password: Option<String>,
    /// Database to migrate.
    pub database: String,
    /// Retention policy (empty = database default).
    #[serde(default = "default_retention")]
    pub retention: String,
    /// Rows per page of the chunked response.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Do not attach the `db` label.
    #[serde(default)]
    pub skip_database_label: bool,
}

fn default_addr() -> String {
    "http://localhost:8086".to_string()
}

fn default_retention() -> String {
    "autogen".to_string()
}

fn default_chunk_size() -> usize {
    10_000
}

/// One series and the fields to read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxSeries {
    /// Measurement name.
    pub measurement: String,
    /// Numeric fields to read, in column order.
    pub fields: Vec<String>,
    /// Tags present on the series.
    pub tags: Vec<Label>,
    /// Every tag key known for the measurement.
    pub tag_keys: Vec<String>,
}

impl fmt::Display for InfluxSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.measurement)?;
        for tag in &self.tags {
            write!(f, ",{}={}", tag.name, tag.value)?;
        }
        write!(f, ":{}", self.fields.join(","))
    }
}

/// Query response envelope.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<ResultSeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultSeries {
    #[serde(default)]
    name: String,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    fn into_series(self) -> std::result::Result<Vec<ResultSeries>, String> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut out = Vec::new();
        for result in self.results {
            if let Some(e) = result.error {
                return Err(e);
            }
            out.extend(result.series);
        }
        Ok(out)
    }
}

/// InfluxDB source reader.
pub struct InfluxReader {
    config: InfluxConfig,
    client: Client,
    stream_client: Client,
}

impl InfluxReader {
    /// Creates a new reader with configured HTTP clients.
    pub fn new(config: InfluxConfig) -> Self {
        Self {
            config,
            client: create_http_client(),
            stream_client: create_streaming_client(),
        }
    }

    fn query_request(&self, client: &Client, query: &str) -> RequestBuilder {
        let mut req = client
            .get(join_url(&self.config.addr, "query"))
            .query(&[("db", self.config.database.as_str()), ("q", query)]);
        if let Some(user) = &self.config.user {
            req = req.basic_auth(user, self.config.password.as_deref());
        }
        req
    }

    /// Runs a metadata query and returns its result series.
    async fn query(&self, query: &str) -> Result<Vec<ResultSeries>> {
        debug!("InfluxDB query: {}", query);
        let response = self
            .query_request(&self.client, query)
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("InfluxDB request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(connection_error(status, &body, "InfluxDB", false));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::SourceConnection(format!("Failed to parse InfluxDB response: {}", e)))?;

        parsed
            .into_series()
            .map_err(|e| Error::SourceConnection(format!("InfluxDB query '{}' failed: {}", query, e)))
    }

    /// Numeric field keys per measurement.
    async fn field_keys(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for series in self.query("SHOW FIELD KEYS").await? {
            for row in series.values {
                let (Some(key), Some(kind)) = (row.first().and_then(|v| v.as_str()), row.get(1).and_then(|v| v.as_str())) else {
                    continue;
                };
                if NUMERIC_FIELD_TYPES.contains(&kind) {
                    fields.entry(series.name.clone()).or_default().push(key.to_string());
                }
            }
        }
        Ok(fields)
    }

    /// Tag keys per measurement.
    async fn tag_keys(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut tags: HashMap<String, Vec<String>> = HashMap::new();
        for series in self.query("SHOW TAG KEYS").await? {
            let keys = series
                .values
                .iter()
                .filter_map(|row| row.first().and_then(|v| v.as_str()).map(String::from))
                .collect();
            tags.insert(series.name, keys);
        }
        Ok(tags)
    }

    /// Builds the `SELECT` for one task.
    fn select_query(&self, task: &InfluxSeries, filter: &Filter) -> String {
        let from = if self.config.retention.is_empty() {
            quote_ident(&task.measurement)
        } else {
            format!(
                "{}.{}",
                quote_ident(&self.config.retention),
                quote_ident(&task.measurement)
            )
        };

        let present: HashMap<&str, &str> = task
            .tags
            .iter()
            .map(|t| (t.name.as_str(), t.value.as_str()))
            .collect();

        // Absent tags must be matched as empty, otherwise the query would
        // merge in every series that carries them.
        let mut conditions: Vec<String> = task
            .tag_keys
            .iter()
            .map(|key| {
                let value = present.get(key.as_str()).copied().unwrap_or("");
                format!("{}={}", quote_ident(key), quote_literal(value))
            })
            .collect();
        if let Some(start) = filter.time_start {
            conditions.push(format!("time >= {}", quote_literal(&start.to_rfc3339())));
        }
        if let Some(end) = filter.time_end {
            conditions.push(format!("time <= {}", quote_literal(&end.to_rfc3339())));
        }

        let fields: Vec<String> = task.fields.iter().map(|f| quote_ident(f)).collect();
        let mut query = format!("SELECT {} FROM {}", fields.join(","), from);
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query
    }

    fn chunk_labels(&self, task: &InfluxSeries) -> Vec<Label> {
        let mut labels = task.tags.clone();
        if !self.config.skip_database_label {
            labels.push(Label::new(DATABASE_LABEL, self.config.database.clone()));
        }
        labels
    }
}

#[async_trait]
impl SourceReader for InfluxReader {
    type Task = InfluxSeries;

    fn source_type(&self) -> &'static str {
        "influx"
    }

    async fn connect(&mut self) -> Result<()> {
        crate::http::validate_url(&self.config.addr)?;
        if self.config.database.is_empty() {
            return Err(Error::Config("InfluxDB database is required".to_string()));
        }

        let ping = self
            .client
            .get(join_url(&self.config.addr, "ping"))
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("InfluxDB unreachable: {}", e)))?;
        if !ping.status().is_success() {
            let status = ping.status();
            let body = ping.text().await.unwrap_or_default();
            return Err(connection_error(status, &body, "InfluxDB", false));
        }

        // Exercises credentials and database access
        self.query("SHOW MEASUREMENTS LIMIT 1").await?;
        info!(
            "Connected to InfluxDB at {} (database {})",
            self.config.addr, self.config.database
        );
        Ok(())
    }

    async fn explore(&self, filter: &Filter) -> Result<Vec<InfluxSeries>> {
        filter.validate()?;

        let fields = self.field_keys().await?;
        let tag_keys = self.tag_keys().await?;

        let show_series = if filter.series.is_empty() {
            "SHOW SERIES".to_string()
        } else {
            format!("SHOW SERIES {}", filter.series)
        };

        let mut keys = BTreeSet::new();
        for series in self.query(&show_series).await? {
            for row in series.values {
                if let Some(key) = row.first().and_then(|v| v.as_str()) {
                    keys.insert(key.to_string());
                }
            }
        }

        let mut tasks = Vec::new();
        for key in keys {
            let (measurement, tags) = parse_series_key(&key);
            let Some(measurement_fields) = fields.get(&measurement) else {
                debug!("Skipping series {} without numeric fields", key);
                continue;
            };
            tasks.push(InfluxSeries {
                tag_keys: tag_keys.get(&measurement).cloned().unwrap_or_default(),
                fields: measurement_fields.clone(),
                measurement,
                tags,
            });
        }

        info!("Found {} series to migrate", tasks.len());
        Ok(tasks)
    }

    async fn read(&self, task: &InfluxSeries, filter: &Filter) -> Result<ChunkStream> {
        let query = self.select_query(task, filter);
        debug!("Reading {}: {}", task, query);

        let chunk_size = self.config.chunk_size.max(1).to_string();
        let response = self
            .query_request(&self.stream_client, &query)
            .query(&[
                ("epoch", "ms"),
                ("chunked", "true"),
                ("chunk_size", chunk_size.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::chunk_read(task.to_string(), e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return match connection_error(status, &body, "InfluxDB", false) {
                e @ Error::Authentication(_) => Err(e),
                e => Err(Error::chunk_read(task.to_string(), e)),
            };
        }

        let pages = PageStream {
            task: task.to_string(),
            measurement: task.measurement.clone(),
            fields: task.fields.clone(),
            labels: self.chunk_labels(task),
            lines: LineReader::new(response),
            done: false,
        };

        Ok(Box::pin(stream::unfold(pages, |mut pages| async move {
            pages.next_chunk().await.map(|item| (item, pages))
        })))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Splits a streamed body into newline-delimited records.
struct LineReader {
    response: Response,
    buf: Vec<u8>,
    scanned: usize,
    eof: bool,
}

impl LineReader {
    fn new(response: Response) -> Self {
        Self {
            response,
            buf: Vec::new(),
            scanned: 0,
            eof: false,
        }
    }

    async fn next_line(&mut self) -> std::result::Result<Option<Vec<u8>>, reqwest::Error> {
        loop {
            if let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                let end = self.scanned + pos;
                let line: Vec<u8> = self.buf.drain(..=end).take(end).collect();
                self.scanned = 0;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line));
            }
            self.scanned = self.buf.len();

            if self.eof {
                let rest = std::mem::take(&mut self.buf);
                self.scanned = 0;
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Ok(Some(rest));
            }

            match self.response.chunk().await? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.eof = true,
            }
        }
    }
}

/// State of one task's chunked response.
struct PageStream {
    task: String,
    measurement: String,
    fields: Vec<String>,
    labels: Vec<Label>,
    lines: LineReader,
    done: bool,
}

impl PageStream {
    async fn next_chunk(&mut self) -> Option<Result<Chunk>> {
        loop {
            if self.done {
                return None;
            }
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::chunk_read(self.task.clone(), e)));
                }
            };

            match self.parse_page(&line) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                // Empty page, keep reading
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }

    fn parse_page(&self, line: &[u8]) -> Result<Option<Chunk>> {
        let page: QueryResponse = serde_json::from_slice(line)
            .map_err(|e| Error::chunk_read(self.task.clone(), format!("bad page: {}", e)))?;
        let series = page
            .into_series()
            .map_err(|e| Error::chunk_read(self.task.clone(), e))?;

        let mut timestamps = Vec::new();
        let mut columns: Vec<Column> = self
            .fields
            .iter()
            .map(|field| Column {
                field: field.clone(),
                values: Vec::new(),
            })
            .collect();

        for s in series {
            // Column 0 is `time`; fall back to select order without a header
            let positions: Vec<usize> = self
                .fields
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    s.columns
                        .iter()
                        .skip(1)
                        .position(|c| c == field)
                        .map_or(i + 1, |p| p + 1)
                })
                .collect();

            for row in s.values {
                let Some(ts) = row.first().and_then(serde_json::Value::as_i64) else {
                    return Err(Error::chunk_read(self.task.clone(), "row without timestamp"));
                };
                timestamps.push(ts);
                for (column, &pos) in columns.iter_mut().zip(&positions) {
                    column.values.push(row.get(pos).and_then(numeric_value));
                }
            }
        }

        if timestamps.is_empty() {
            return Ok(None);
        }
        Ok(Some(Chunk {
            measurement: self.measurement.clone(),
            labels: self.labels.clone(),
            timestamps,
            columns,
        }))
    }
}

fn numeric_value(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Parses a line-protocol series key (`cpu,host=a,region=eu`).
pub(crate) fn parse_series_key(key: &str) -> (String, Vec<Label>) {
    let mut parts = split_unescaped(key, ',').into_iter();
    let measurement = unescape(&parts.next().unwrap_or_default());
    let tags = parts
        .filter_map(|pair| {
            let kv = split_unescaped(&pair, '=');
            match kv.as_slice() {
                [k, v] => Some(Label::new(unescape(k), unescape(v))),
                _ => None,
            }
        })
        .collect();
    (measurement, tags)
}

fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            out.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    out.push(current);
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(',' | '=' | ' ' | '\\' | '"') => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Quotes an InfluxQL identifier.
fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Quotes an InfluxQL string literal.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
#[path = "influx_tests.rs"]
mod tests;
