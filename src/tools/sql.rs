use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info};

use super::{Tool, ToolError, ToolOutput};

pub type Row = Map<String, Value>;

/// The structured-query execution service.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, parameters: &[Value]) -> Result<Vec<Row>, ToolError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

/// Uniform envelope for query outcomes, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub data: Vec<Row>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn success(data: Vec<Row>) -> Self {
        Self { status: QueryStatus::Success, row_count: data.len(), data, error: None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Error,
            data: Vec::new(),
            row_count: 0,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }
}

/// Reject anything but a single read-only statement.
pub fn ensure_read_only(query: &str) -> Result<&str, ToolError> {
    let body = skip_leading_comments(query);
    let body = body.trim_end().trim_end_matches(';').trim_end();
    if body.is_empty() {
        return Err(ToolError::Rejected("empty query".to_string()));
    }
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if keyword != "SELECT" {
        return Err(ToolError::Rejected("Only SELECT queries are allowed".to_string()));
    }
    if body.contains(';') {
        return Err(ToolError::Rejected("only a single statement is allowed".to_string()));
    }
    Ok(body)
}

fn skip_leading_comments(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("--") {
            s = rest.split_once('\n').map(|(_, after)| after).unwrap_or("");
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = rest.split_once("*/").map(|(_, after)| after).unwrap_or("");
        } else {
            return s;
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryArgs {
    query: String,
    #[serde(default)]
    parameters: Vec<Value>,
}

/// Exposes a [`QueryExecutor`] to the model as the `sql_query` tool.
#[derive(Clone)]
pub struct SqlQueryTool {
    executor: Arc<dyn QueryExecutor>,
}

impl SqlQueryTool {
    pub const NAME: &'static str = "sql_query";

    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Run one read-only SQL SELECT statement. \
         Arguments: {\"query\": string, \"parameters\": array (optional)}"
    }

    async fn call(&self, arguments: &Value) -> Result<ToolOutput, ToolError> {
        let args: QueryArgs =
            serde_json::from_value(arguments.clone()).map_err(|e| ToolError::InvalidArguments {
                tool: Self::NAME.to_string(),
                message: e.to_string(),
            })?;
        let query = ensure_read_only(&args.query)?;

        let result = match self.executor.execute(query, &args.parameters).await {
            Ok(rows) => {
                info!(rows = rows.len(), "query executed");
                QueryResult::success(rows)
            }
            Err(e) => {
                error!(error = %e, "query execution failed");
                QueryResult::failure(e.to_string())
            }
        };

        let is_error = !result.is_success();
        let content = serde_json::to_value(&result).map_err(|e| ToolError::Execution {
            tool: Self::NAME.to_string(),
            message: e.to_string(),
        })?;
        Ok(ToolOutput { tool: Self::NAME.to_string(), content, is_error })
    }
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<Row>,
}

/// Query service reached over HTTP: `POST {url}` with `{"query", "parameters"}`,
/// answering `{"rows": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpQueryExecutor {
    client: Client,
    url: String,
}

impl HttpQueryExecutor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| ToolError::Execution {
            tool: SqlQueryTool::NAME.to_string(),
            message: format!("Failed to create HTTP client: {}", e),
        })?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, query: &str, parameters: &[Value]) -> Result<Vec<Row>, ToolError> {
        let failed = |message: String| ToolError::Execution {
            tool: SqlQueryTool::NAME.to_string(),
            message,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "parameters": parameters }))
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("query service returned {}: {}", status.as_u16(), body)));
        }

        let parsed: RowsResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("invalid query service response: {}", e)))?;
        Ok(parsed.rows)
    }
}
