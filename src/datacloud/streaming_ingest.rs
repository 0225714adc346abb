//! Streaming ingestion of JSON records.
//!
//! Records are grouped under the streaming payload limit and sent one group
//! per request. Requests run strictly in order and the first failure stops
//! the remaining groups; groups already accepted stay accepted.

use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::info;

use crate::chunking::split_records;
use crate::datacloud::client::Payload;
use crate::datacloud::{ApiResponse, DataCloudClient};
use crate::error::{ApiOperation, AppError};

/// Wire envelope of a streaming ingest request.
#[derive(Serialize)]
struct StreamingPayload<'a, T> {
    data: &'a [T],
}

impl DataCloudClient {
    /// Upserts records through the streaming ingest API.
    ///
    /// Each group is posted to `/api/v1/ingest/sources/{source}/{object}`,
    /// or to its `/actions/test` validation endpoint in test mode, and must
    /// be answered with 202.
    ///
    /// The streaming limit bounds the summed serialized size of a group's
    /// records. The `{"data":[...]}` envelope and separators come on top, so
    /// a full request body is slightly larger than the limit.
    ///
    /// # Arguments
    ///
    /// * `source_name` - Ingest API connector name
    /// * `object_name` - Object (resource type) within the connector
    /// * `records` - Rows to upsert, in order
    /// * `test_mode` - Validate only, without ingesting
    ///
    /// # Returns
    ///
    /// The response to the last request, or `None` for empty input.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - A request was not answered with 202
    /// - `AppError::Internal` - A record could not be serialized
    pub async fn streaming_upsert<T: Serialize>(
        &mut self,
        source_name: &str,
        object_name: &str,
        records: &[T],
        test_mode: bool,
    ) -> Result<Option<ApiResponse>, AppError> {
        let groups = split_records(records, self.config.streaming_max_payload_bytes)?;
        let group_count = groups.len();
        let mut last_response = None;

        for (index, group) in groups.into_iter().enumerate() {
            self.ensure_valid_token(false).await?;

            let mut segments = vec!["api", "v1", "ingest", "sources", source_name, object_name];
            if test_mode {
                segments.extend(["actions", "test"]);
            }
            let url = self.platform_endpoint(&segments)?;

            let body = serde_json::to_vec(&StreamingPayload { data: group }).map_err(|e| {
                AppError::Internal(format!("Failed to serialize streaming payload: {}", e))
            })?;

            info!(
                "[STREAM-INGEST] POST {}/{} group {}/{} ({} records, {} bytes{})",
                source_name,
                object_name,
                index + 1,
                group_count,
                group.len(),
                body.len(),
                if test_mode { ", test mode" } else { "" }
            );

            let response = self
                .send_authed(
                    ApiOperation::StreamingUpsert,
                    Method::POST,
                    url,
                    Payload::Json(body),
                    StatusCode::ACCEPTED,
                )
                .await?;

            last_response = Some(response);
        }

        Ok(last_response)
    }
}
