//! SQL query execution with batch pagination.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::datacloud::client::Payload;
use crate::datacloud::{DataCloudClient, Record};
use crate::error::{ApiOperation, AppError};

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
}

/// One page of a query response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryPage {
    #[serde(default)]
    data: Vec<Vec<Value>>,
    /// Column name to `{"type": ..., "placeInOrder": n}`.
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default)]
    next_batch_id: Option<String>,
    #[serde(default)]
    query_id: Option<String>,
}

fn default_done() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// QueryResult
// ─────────────────────────────────────────────────────────────────────────────

/// Every row of a query, in arrival order across all pages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Column names, in result order.
    pub columns: Vec<String>,
    /// Rows, each aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
    /// Service-assigned query id, when reported.
    pub query_id: Option<String>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as column-keyed records. Values beyond the known columns are dropped.
    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Orders metadata keys by `placeInOrder`; keys without one keep their
/// response order after the placed ones.
fn ordered_columns(metadata: &Map<String, Value>) -> Vec<String> {
    let mut columns: Vec<(u64, &String)> = metadata
        .iter()
        .map(|(name, meta)| {
            let place = meta
                .get("placeInOrder")
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX);
            (place, name)
        })
        .collect();
    columns.sort_by_key(|(place, _)| *place);
    columns.into_iter().map(|(_, name)| name.clone()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

impl DataCloudClient {
    /// Runs a SQL query and collects every result page.
    ///
    /// The first page comes from `POST /api/v2/query`; while a page reports
    /// `done: false`, the next one is fetched from
    /// `GET /api/v2/query/{nextBatchId}`.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - Any page request was not answered with 200
    /// - `AppError::InvalidResponse` - A page could not be parsed, or a page
    ///   that is not done carried no `nextBatchId`
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult, AppError> {
        self.ensure_valid_token(false).await?;

        let url = self.platform_endpoint(&["api", "v2", "query"])?;
        let body = serde_json::to_vec(&QueryRequest { sql })
            .map_err(|e| AppError::Internal(format!("Failed to serialize query: {}", e)))?;

        info!("[QUERY] POST /query ({} chars)", sql.len());

        let response = self
            .send_authed(
                ApiOperation::Query,
                Method::POST,
                url,
                Payload::Json(body),
                StatusCode::OK,
            )
            .await?;
        let mut page: WireQueryPage = response.json(ApiOperation::Query)?;

        let mut result = QueryResult {
            columns: ordered_columns(&page.metadata),
            rows: Vec::new(),
            query_id: page.query_id.take(),
        };
        let mut page_count = 1usize;

        loop {
            result.rows.append(&mut page.data);

            if page.done {
                break;
            }

            let next_batch_id = page.next_batch_id.take().ok_or_else(|| AppError::InvalidResponse {
                operation: ApiOperation::Query,
                message: "Page is not done but carries no nextBatchId".to_string(),
            })?;

            self.ensure_valid_token(false).await?;
            let url = self.platform_endpoint(&["api", "v2", "query", &next_batch_id])?;

            info!("[QUERY] GET /query/{{nextBatchId}} (page {})", page_count + 1);

            let response = self
                .send_authed(
                    ApiOperation::Query,
                    Method::GET,
                    url,
                    Payload::None,
                    StatusCode::OK,
                )
                .await?;
            page = response.json(ApiOperation::Query)?;
            page_count += 1;
        }

        info!(
            "[QUERY] Returned {} rows in {} pages",
            result.rows.len(),
            page_count
        );
        Ok(result)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datacloud::test_support::authed_client;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SQL: &str = "SELECT ssot__Id__c, ssot__FirstName__c FROM ssot__Individual__dlm";

    fn metadata() -> Value {
        json!({
            "ssot__FirstName__c": {"type": "VARCHAR", "placeInOrder": 1, "typeCode": 12},
            "ssot__Id__c": {"type": "VARCHAR", "placeInOrder": 0, "typeCode": 12}
        })
    }

    #[test]
    fn columns_follow_place_in_order() {
        let meta = metadata();
        let columns = ordered_columns(meta.as_object().unwrap());
        assert_eq!(columns, vec!["ssot__Id__c", "ssot__FirstName__c"]);
    }

    #[test]
    fn columns_without_place_keep_response_order() {
        let meta = json!({"b": {}, "a": {"placeInOrder": 0}, "c": {"type": "NUMBER"}});
        let columns = ordered_columns(meta.as_object().unwrap());
        assert_eq!(columns, vec!["a", "b", "c"]);
    }

    #[test]
    fn records_zip_columns_and_rows() {
        let result = QueryResult {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: vec![vec![json!("1"), json!("Ada")]],
            query_id: None,
        };

        let records = result.records();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], "1");
        assert_eq!(records[0]["name"], "Ada");
    }

    #[tokio::test]
    async fn single_page_query() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .and(body_json(json!({ "sql": SQL })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [["001", "Sandeep"], ["002", "Aaron"]],
                "metadata": metadata(),
                "done": true,
                "queryId": "q-123",
                "rowCount": 2
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client.query(SQL).await.unwrap();

        assert_eq!(result.columns, vec!["ssot__Id__c", "ssot__FirstName__c"]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows[1], vec![json!("002"), json!("Aaron")]);
        assert_eq!(result.query_id.as_deref(), Some("q-123"));
    }

    #[tokio::test]
    async fn every_page_is_kept_in_order() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [["001", "A"], ["002", "B"]],
                "metadata": metadata(),
                "done": false,
                "nextBatchId": "batch-2"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/query/batch-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [["003", "C"]],
                "done": false,
                "nextBatchId": "batch-3"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/query/batch-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [["004", "D"], ["005", "E"]],
                "done": true
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client.query(SQL).await.unwrap();

        let ids: Vec<&str> = result.rows.iter().map(|r| r[0].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["001", "002", "003", "004", "005"]);
        assert_eq!(result.columns.len(), 2);
    }

    #[tokio::test]
    async fn empty_result_has_columns_and_no_rows() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "metadata": metadata(),
                "done": true
            })))
            .mount(&mock_server)
            .await;

        let result = client.query(SQL).await.unwrap();

        assert!(result.is_empty());
        assert_eq!(result.columns.len(), 2);
    }

    #[tokio::test]
    async fn rejected_query_is_structured() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"[{"errorCode":"MALFORMED_QUERY","message":"syntax error at line 1"}]"#,
            ))
            .mount(&mock_server)
            .await;

        match client.query("SELEC nothing").await {
            Err(AppError::Api {
                operation,
                url,
                status,
                body,
            }) => {
                assert_eq!(operation, ApiOperation::Query);
                assert!(url.ends_with("/api/v2/query"));
                assert_eq!(status, 400);
                assert!(body.contains("MALFORMED_QUERY"));
            }
            other => panic!("Expected Api error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failing_next_page_is_structured() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [["001", "A"]],
                "metadata": metadata(),
                "done": false,
                "nextBatchId": "batch-2"
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/query/batch-2"))
            .respond_with(ResponseTemplate::new(410).set_body_string("batch expired"))
            .mount(&mock_server)
            .await;

        let err = client.query(SQL).await.unwrap_err();

        assert_eq!(err.operation(), Some(ApiOperation::Query));
        assert_eq!(err.status(), Some(410));
    }

    #[tokio::test]
    async fn unfinished_page_without_batch_id_is_invalid() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "metadata": {},
                "done": false
            })))
            .mount(&mock_server)
            .await;

        let err = client.query(SQL).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidResponse {
                operation: ApiOperation::Query,
                ..
            }
        ));
    }
}
