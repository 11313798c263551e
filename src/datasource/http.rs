//! HTTP data source
//!
//! Remote tables over JSON/HTTP with the endpoint set `tables`,
//! `schema/{table}`, `query/{table}`, `insert/{table}`, `update/{table}`,
//! `delete/{table}`, `_health`. Bearer, basic, and api-key authentication,
//! optional templated headers, and fixed-delay retries on 5xx or connection
//! errors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::datasource::template::{render, TemplateContext};
use crate::error::{Error, Result};
use crate::rowset;
use crate::sql::ast::{BinOp, Expr};
use crate::storage::engine::{ScanRequest, StorageEngine, TxnContext};
use crate::storage::schema::{ColumnDescriptor, SemanticType, TableDescriptor};
use crate::storage::value::{Row, Value};

/// Authentication modes for the remote endpoint.
#[derive(Debug, Clone)]
pub enum HttpAuth {
    None,
    Bearer { token: String },
    Basic { user: String, password: String },
    ApiKey { header: String, key: String },
}

/// Remote table source configuration.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub name: String,
    pub base_url: String,
    pub auth: HttpAuth,
    /// Header name -> template expression.
    pub headers: Vec<(String, String)>,
    pub retry_count: usize,
    pub retry_delay: Duration,
    pub read_only: bool,
    pub timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            name: "http".into(),
            base_url: "http://localhost:8080".into(),
            auth: HttpAuth::None,
            headers: Vec::new(),
            retry_count: 2,
            retry_delay: Duration::from_millis(200),
            read_only: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP-backed table source. Besides the storage-engine seam it implements
/// the data-source plugin capability, so it can live in the plugin registry
/// and serve `query`/`execute` calls over connection handles.
pub struct HttpTableSource {
    config: HttpSourceConfig,
    client: reqwest::Client,
    running: std::sync::atomic::AtomicBool,
    next_handle: std::sync::atomic::AtomicU64,
    handles: std::sync::Mutex<std::collections::HashSet<u64>>,
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct AffectedResponse {
    affected: u64,
}

#[derive(Deserialize)]
struct SchemaResponse {
    columns: Vec<SchemaColumn>,
    #[serde(default)]
    primary_key: Vec<String>,
}

#[derive(Deserialize)]
struct SchemaColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default = "default_true")]
    nullable: bool,
}

fn default_true() -> bool {
    true
}

impl HttpTableSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            running: std::sync::atomic::AtomicBool::new(false),
            next_handle: std::sync::atomic::AtomicU64::new(1),
            handles: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.config.name
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            HttpAuth::None => request,
            HttpAuth::Bearer { token } => request.bearer_auth(token),
            HttpAuth::Basic { user, password } => request.basic_auth(user, Some(password)),
            HttpAuth::ApiKey { header, key } => request.header(header.as_str(), key.as_str()),
        }
    }

    fn auth_token(&self) -> String {
        match &self.config.auth {
            HttpAuth::Bearer { token } => token.clone(),
            HttpAuth::ApiKey { key, .. } => key.clone(),
            _ => String::new(),
        }
    }

    fn build_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::RequestBuilder> {
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let ctx = TemplateContext {
            method: method.to_string(),
            path: format!("/{path}"),
            body: body_text,
            auth_token: self.auth_token(),
        };
        let mut request = self.client.request(method, self.url(path));
        request = self.apply_auth(request);
        for (header, template) in &self.config.headers {
            request = request.header(header.as_str(), render(template, &ctx)?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request)
    }

    /// Issue the request with retries: only 5xx responses and connection
    /// errors retry, `retry_count + 1` attempts total, fixed delay between.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let attempts = self.config.retry_count + 1;
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let request = self.build_request(method.clone(), path, body.as_ref())?;
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        tracing::debug!(%status, path, attempt, "Remote 5xx, will retry");
                        last_error = Some(Error::Remote(format!(
                            "remote returned {status} for {path}"
                        )));
                        continue;
                    }
                    if !status.is_success() {
                        // 4xx does not retry.
                        return Err(Error::Remote(format!(
                            "remote returned {status} for {path}"
                        )));
                    }
                    return Ok(response);
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!(%e, path, attempt, "Connection error, will retry");
                    last_error = Some(Error::Http(e));
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Remote(format!("request to {path} failed"))))
    }

    /// List tables served by the remote.
    pub async fn tables(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TablesResponse {
            tables: Vec<String>,
        }
        let response = self.send(reqwest::Method::GET, "tables", None).await?;
        let parsed: TablesResponse = response.json().await?;
        Ok(parsed.tables)
    }

    /// Fetch the remote schema for a table.
    pub async fn schema(&self, table: &str) -> Result<TableDescriptor> {
        let response = self
            .send(reqwest::Method::GET, &format!("schema/{table}"), None)
            .await?;
        let parsed: SchemaResponse = response.json().await?;
        let columns = parsed
            .columns
            .into_iter()
            .map(|c| {
                let mut desc = ColumnDescriptor::new(c.name, map_remote_type(&c.type_name));
                desc.nullable = c.nullable;
                desc
            })
            .collect::<Vec<_>>();
        let mut desc = TableDescriptor {
            name: table.to_string(),
            columns,
            primary_key: parsed.primary_key,
            indexes: vec![],
            persistence: Default::default(),
            engine: crate::storage::schema::TableEngine::Http {
                source: self.config.name.clone(),
            },
            fulltext: vec![],
        };
        for pk in desc.primary_key.clone() {
            if let Some(c) = desc.columns.iter_mut().find(|c| c.name == pk) {
                c.primary_key = true;
                c.nullable = false;
            }
        }
        Ok(desc)
    }

    pub async fn health(&self) -> Result<bool> {
        let response = self.send(reqwest::Method::GET, "_health", None).await?;
        Ok(response.status().is_success())
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly(format!(
                "{}:{table}",
                self.config.name
            )));
        }
        Ok(())
    }
}

/// Value <-> JSON mapping at the remote boundary.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => json!(i),
        Value::Uint(u) => json!(u),
        Value::Float(f) => json!(f),
        Value::Bool(b) => json!(b),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => json!(String::from_utf8_lossy(b)),
        Value::Time(t) => json!(t.to_rfc3339()),
        Value::Json(j) => j.clone(),
    }
}

pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        other => Value::Json(other.clone()),
    }
}

fn map_remote_type(name: &str) -> SemanticType {
    match name.to_lowercase().as_str() {
        "int" | "integer" | "bigint" => SemanticType::Int,
        "uint" | "unsigned" => SemanticType::Uint,
        "float" | "double" | "number" => SemanticType::Float,
        "bool" | "boolean" => SemanticType::Bool,
        "bytes" | "binary" => SemanticType::Bytes,
        "time" | "timestamp" | "datetime" => SemanticType::Time,
        "json" | "object" => SemanticType::Json,
        _ => SemanticType::String,
    }
}

fn rows_from_response(rows: Vec<serde_json::Map<String, serde_json::Value>>) -> Vec<Row> {
    rows.into_iter()
        .map(|obj| {
            Row::from_pairs(
                obj.into_iter()
                    .map(|(k, v)| (k, json_to_value(&v)))
                    .collect(),
            )
        })
        .collect()
}

/// Equality-conjunction filters translate to the remote filter map; anything
/// else is evaluated locally after the fetch.
fn filter_to_map(filter: &Expr) -> Option<HashMap<String, serde_json::Value>> {
    let mut factors = Vec::new();
    filter.clone().split_conjunction(&mut factors);
    let mut map = HashMap::new();
    for f in factors {
        match f {
            Expr::Binary {
                left,
                op: BinOp::Eq,
                right,
            } => match (*left, *right) {
                (Expr::Column { name, .. }, Expr::Literal(v))
                | (Expr::Literal(v), Expr::Column { name, .. }) => {
                    map.insert(name, value_to_json(&v));
                }
                _ => return None,
            },
            _ => return None,
        }
    }
    Some(map)
}

#[async_trait]
impl StorageEngine for HttpTableSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_table(&self, desc: &TableDescriptor) -> Result<()> {
        Err(Error::Unsupported(format!(
            "remote source '{}' does not accept DDL for '{}'",
            self.config.name, desc.name
        )))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        Err(Error::Unsupported(format!(
            "remote source '{}' does not accept DDL for '{table}'",
            self.config.name
        )))
    }

    async fn insert(&self, _txn: &TxnContext, table: &str, rows: Vec<Row>) -> Result<u64> {
        self.check_writable(table)?;
        let json_rows: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| {
                serde_json::Value::Object(
                    r.columns()
                        .iter()
                        .zip(r.values())
                        .map(|(c, v)| (c.clone(), value_to_json(v)))
                        .collect(),
                )
            })
            .collect();
        let response = self
            .send(
                reqwest::Method::POST,
                &format!("insert/{table}"),
                Some(json!({ "rows": json_rows })),
            )
            .await?;
        let parsed: AffectedResponse = response.json().await?;
        Ok(parsed.affected)
    }

    async fn update(
        &self,
        _txn: &TxnContext,
        table: &str,
        assignments: &[(String, Value)],
        filter: Option<&Expr>,
    ) -> Result<u64> {
        self.check_writable(table)?;
        let set: serde_json::Map<String, serde_json::Value> = assignments
            .iter()
            .map(|(c, v)| (c.clone(), value_to_json(v)))
            .collect();
        let filter_map = match filter {
            Some(f) => Some(filter_to_map(f).ok_or_else(|| {
                Error::Unsupported("remote update filters must be equality conjunctions".into())
            })?),
            None => None,
        };
        let response = self
            .send(
                reqwest::Method::POST,
                &format!("update/{table}"),
                Some(json!({ "set": set, "filter": filter_map })),
            )
            .await?;
        let parsed: AffectedResponse = response.json().await?;
        Ok(parsed.affected)
    }

    async fn delete(&self, _txn: &TxnContext, table: &str, filter: Option<&Expr>) -> Result<u64> {
        self.check_writable(table)?;
        let filter_map = match filter {
            Some(f) => Some(filter_to_map(f).ok_or_else(|| {
                Error::Unsupported("remote delete filters must be equality conjunctions".into())
            })?),
            None => None,
        };
        let response = self
            .send(
                reqwest::Method::POST,
                &format!("delete/{table}"),
                Some(json!({ "filter": filter_map })),
            )
            .await?;
        let parsed: AffectedResponse = response.json().await?;
        Ok(parsed.affected)
    }

    async fn scan(&self, _txn: &TxnContext, table: &str, request: &ScanRequest) -> Result<Vec<Row>> {
        // Push equality filters to the remote; everything else is applied
        // locally after the fetch.
        let remote_filter = request.filter.as_ref().and_then(filter_to_map);
        let body = json!({ "filter": remote_filter });
        let response = self
            .send(reqwest::Method::POST, &format!("query/{table}"), Some(body))
            .await?;
        let parsed: RowsResponse = response.json().await?;
        let mut rows = rows_from_response(parsed.rows);

        if remote_filter.is_none() {
            if let Some(filter) = &request.filter {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if rowset::eval_predicate(filter, &row)? {
                        kept.push(row);
                    }
                }
                rows = kept;
            }
        }
        if let Some(cols) = &request.projection {
            rows = rows.into_iter().map(|r| r.project(cols)).collect();
        }
        Ok(rows)
    }

    async fn index_lookup(
        &self,
        txn: &TxnContext,
        table: &str,
        _index: &str,
        key: &Value,
    ) -> Result<Vec<Row>> {
        // Remote tables have no local indexes; equality scans stand in.
        let request = ScanRequest {
            filter: Some(Expr::binary(
                Expr::column("id"),
                BinOp::Eq,
                Expr::Literal(key.clone()),
            )),
            ..Default::default()
        };
        self.scan(txn, table, &request).await
    }

    async fn table_rows(&self, txn: &TxnContext, table: &str) -> Result<u64> {
        Ok(self.scan(txn, table, &ScanRequest::default()).await?.len() as u64)
    }
}

#[async_trait]
impl crate::plugin::LifecycleCapable for HttpTableSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    async fn initialize(&self, _config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::plugin::DataSourceCapable for HttpTableSource {
    async fn connect(&self, _dsn: &str) -> Result<crate::plugin::ConnectionHandle> {
        let handle = self
            .next_handle
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.handles.lock().unwrap().insert(handle);
        Ok(handle)
    }

    async fn disconnect(&self, handle: crate::plugin::ConnectionHandle) -> Result<()> {
        if self.handles.lock().unwrap().remove(&handle) {
            Ok(())
        } else {
            Err(Error::Plugin(format!("unknown connection handle {handle}")))
        }
    }

    /// SQL over a remote handle: single-table SELECTs map onto the query
    /// endpoint with local filter evaluation; parameters bind positionally.
    async fn query(
        &self,
        handle: crate::plugin::ConnectionHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        self.check_handle(handle)?;
        let statement = bind_params(crate::sql::parse(sql)?, params)?;
        let select = match statement {
            crate::sql::ast::Statement::Select(s) => s,
            other => {
                return Err(Error::Unsupported(format!(
                    "remote query must be a SELECT, got {:?}",
                    other.class()
                )))
            }
        };
        let from = select
            .from
            .as_ref()
            .ok_or_else(|| Error::Unsupported("remote SELECT needs a table".into()))?;
        if !from.joins.is_empty() {
            return Err(Error::Unsupported("joins over a remote handle".into()));
        }
        let txn = TxnContext {
            xid: 0,
            snapshot: 0,
            isolation: crate::storage::engine::Isolation::ReadCommitted,
        };
        let request = ScanRequest {
            filter: select.selection.clone(),
            ..Default::default()
        };
        let mut rows = StorageEngine::scan(self, &txn, &from.base.name, &request).await?;
        if !select.order_by.is_empty() {
            rowset::sort_rows(&mut rows, &select.order_by)?;
        }
        Ok(rowset::paginate(rows, select.offset, select.limit))
    }

    async fn execute(
        &self,
        handle: crate::plugin::ConnectionHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        self.check_handle(handle)?;
        let statement = bind_params(crate::sql::parse(sql)?, params)?;
        let txn = TxnContext {
            xid: 0,
            snapshot: 0,
            isolation: crate::storage::engine::Isolation::ReadCommitted,
        };
        match statement {
            crate::sql::ast::Statement::Insert(i) => {
                let empty = Row::from_pairs(vec![]);
                let mut rows = Vec::with_capacity(i.rows.len());
                for exprs in &i.rows {
                    let mut pairs = Vec::with_capacity(exprs.len());
                    for (column, expr) in i.columns.iter().zip(exprs) {
                        pairs.push((column.clone(), rowset::eval_expr(expr, &empty)?));
                    }
                    rows.push(Row::from_pairs(pairs));
                }
                StorageEngine::insert(self, &txn, &i.table, rows).await
            }
            crate::sql::ast::Statement::Update(u) => {
                let empty = Row::from_pairs(vec![]);
                let mut assignments = Vec::with_capacity(u.assignments.len());
                for (column, expr) in &u.assignments {
                    assignments.push((column.clone(), rowset::eval_expr(expr, &empty)?));
                }
                StorageEngine::update(self, &txn, &u.table, &assignments, u.selection.as_ref())
                    .await
            }
            crate::sql::ast::Statement::Delete(d) => {
                StorageEngine::delete(self, &txn, &d.table, d.selection.as_ref()).await
            }
            other => Err(Error::Unsupported(format!(
                "remote execute of {:?}",
                other.class()
            ))),
        }
    }
}

impl HttpTableSource {
    fn check_handle(&self, handle: u64) -> Result<()> {
        if self.handles.lock().unwrap().contains(&handle) {
            Ok(())
        } else {
            Err(Error::Plugin(format!("unknown connection handle {handle}")))
        }
    }
}

/// Positional `?` binding for plugin query/execute calls.
fn bind_params(
    statement: crate::sql::ast::Statement,
    params: &[Value],
) -> Result<crate::sql::ast::Statement> {
    if params.is_empty() {
        return Ok(statement);
    }
    crate::dispatch::bind_statement_params(&statement, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_value_round_trip() {
        let values = [
            Value::Null,
            Value::Int(-3),
            Value::Uint(u64::MAX),
            Value::Bool(true),
            Value::Str("héllo".into()),
        ];
        for v in values {
            let j = value_to_json(&v);
            let back = json_to_value(&j);
            match (&v, &back) {
                (Value::Uint(a), Value::Uint(b)) => assert_eq!(a, b),
                _ => assert_eq!(v, back),
            }
        }
    }

    #[test]
    fn test_filter_map_only_for_eq_conjunctions() {
        let eq = Expr::binary(Expr::column("id"), BinOp::Eq, Expr::Literal(Value::Int(1)));
        let map = filter_to_map(&eq).unwrap();
        assert_eq!(map["id"], json!(1));

        let both = Expr::binary(
            eq.clone(),
            BinOp::And,
            Expr::binary(Expr::column("n"), BinOp::Eq, Expr::Literal(Value::Str("x".into()))),
        );
        assert_eq!(filter_to_map(&both).unwrap().len(), 2);

        let range = Expr::binary(Expr::column("id"), BinOp::Gt, Expr::Literal(Value::Int(1)));
        assert!(filter_to_map(&range).is_none());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let source = HttpTableSource::new(HttpSourceConfig {
            read_only: true,
            ..Default::default()
        })
        .unwrap();
        let err = source.check_writable("users").unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert_eq!(err.mysql_code(), 1290);
    }

    #[test]
    fn test_remote_type_mapping() {
        assert_eq!(map_remote_type("INTEGER"), SemanticType::Int);
        assert_eq!(map_remote_type("number"), SemanticType::Float);
        assert_eq!(map_remote_type("mystery"), SemanticType::String);
    }

    #[test]
    fn test_rows_from_response() {
        let raw = serde_json::json!([{"id": 1, "name": "Alice"}]);
        let rows = rows_from_response(
            raw.as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_object().unwrap().clone())
                .collect(),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get("name"), Some(&Value::Str("Alice".into())));
    }
}
