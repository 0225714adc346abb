//! Ingest job administration: listing, inspection and abort.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::datacloud::client::Payload;
use crate::datacloud::{ApiResponse, DataCloudClient};
use crate::error::{ApiOperation, AppError};

/// Default page size for job listings.
pub const DEFAULT_LIST_LIMIT: u32 = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Remote state of an ingest job. The service owns transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Failed,
    Aborted,
    /// Any state this client does not know about.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Open => "Open",
            JobState::UploadComplete => "UploadComplete",
            JobState::InProgress => "InProgress",
            JobState::JobComplete => "JobComplete",
            JobState::Failed => "Failed",
            JobState::Aborted => "Aborted",
            JobState::Unknown => "Unknown",
        }
    }

    /// Whether the service will accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::JobComplete | JobState::Failed | JobState::Aborted
        )
    }
}

/// Information about a bulk ingest job.
///
/// Fields this client does not model are kept in `extra`, so the value
/// serializes back to everything the service reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    /// Unique identifier for the job.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    /// Target object within the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Ingest API connector name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// `upsert` or `delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of the job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobList {
    #[serde(default)]
    pub data: Vec<JobInfo>,
    #[serde(default = "default_done")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

/// Filters and paging for [`DataCloudClient::list_jobs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListJobsParams {
    /// Page size; the service caps it at 100.
    pub limit: u32,
    /// Rows to skip before the page starts.
    pub offset: u32,
    /// Ordering field, e.g. `systemModstamp`. Service default when `None`.
    pub order_by: Option<String>,
    /// Only jobs in these states. All states when empty.
    pub states: Vec<JobState>,
}

impl Default for ListJobsParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            order_by: None,
            states: Vec::new(),
        }
    }
}

impl ListJobsParams {
    /// Default paging restricted to `states`.
    pub fn with_states(states: impl IntoIterator<Item = JobState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Request body for changing job state (close or abort).
#[derive(Debug, Serialize)]
struct UpdateJobStateRequest {
    state: JobState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

impl DataCloudClient {
    /// Lists ingest jobs.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - The service did not answer with 200
    /// - `AppError::InvalidResponse` - The listing could not be parsed
    pub async fn list_jobs(&mut self, params: &ListJobsParams) -> Result<JobList, AppError> {
        self.ensure_valid_token(false).await?;

        let mut url = self.platform_endpoint(&["api", "v1", "ingest", "jobs"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("limit", &params.limit.to_string())
                .append_pair("offset", &params.offset.to_string());
            if let Some(order_by) = &params.order_by {
                query.append_pair("orderby", order_by);
            }
            if !params.states.is_empty() {
                let states: Vec<&str> = params.states.iter().map(JobState::as_str).collect();
                query.append_pair("states", &states.join(","));
            }
        }

        info!(
            "[JOBS] GET /jobs (limit {}, offset {}, states {:?})",
            params.limit, params.offset, params.states
        );

        let response = self
            .send_authed(
                ApiOperation::ListJobs,
                Method::GET,
                url,
                Payload::None,
                StatusCode::OK,
            )
            .await?;

        let list: JobList = response.json(ApiOperation::ListJobs)?;
        info!("[JOBS] Listed {} jobs", list.data.len());
        Ok(list)
    }

    /// Retrieves detailed information about one job.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - The service did not answer with 200 (e.g. unknown id)
    /// - `AppError::InvalidResponse` - The body could not be parsed
    pub async fn job_info(&mut self, job_id: &str) -> Result<JobInfo, AppError> {
        self.ensure_valid_token(false).await?;

        let url = self.platform_endpoint(&["api", "v1", "ingest", "jobs", job_id])?;

        info!("[JOBS] GET /jobs/{}", redact_id(job_id));

        let response = self
            .send_authed(
                ApiOperation::JobInfo,
                Method::GET,
                url,
                Payload::None,
                StatusCode::OK,
            )
            .await?;

        response.json(ApiOperation::JobInfo)
    }

    /// Requests that the service abort a job.
    ///
    /// The service decides whether the transition is allowed; aborting a job
    /// that already reached a terminal state fails with its error response.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - The service did not answer with 200
    /// - `AppError::InvalidResponse` - The body could not be parsed
    pub async fn abort_job(&mut self, job_id: &str) -> Result<JobInfo, AppError> {
        let response = self
            .update_job_state(job_id, JobState::Aborted, ApiOperation::AbortJob)
            .await?;
        response.json(ApiOperation::AbortJob)
    }

    /// Aborts every job in `Open` or `UploadComplete`, in listing order.
    ///
    /// Only the first listing page is swept. The first failing abort stops
    /// the sweep.
    ///
    /// # Returns
    ///
    /// Ids of the jobs that were aborted.
    pub async fn abort_all_jobs(&mut self) -> Result<Vec<String>, AppError> {
        let params = ListJobsParams::with_states([JobState::Open, JobState::UploadComplete]);
        let list = self.list_jobs(&params).await?;

        let mut aborted = Vec::with_capacity(list.data.len());
        for job in list.data {
            info!("[JOBS] Aborting job {}", redact_id(&job.id));
            if let Err(e) = self.abort_job(&job.id).await {
                warn!(
                    "[JOBS] Abort sweep stopped after {} jobs: {}",
                    aborted.len(),
                    e.sanitized()
                );
                return Err(e);
            }
            aborted.push(job.id);
        }

        info!("[JOBS] Aborted {} jobs", aborted.len());
        Ok(aborted)
    }

    /// PATCHes a job's state. Shared by close and abort.
    pub(crate) async fn update_job_state(
        &mut self,
        job_id: &str,
        state: JobState,
        operation: ApiOperation,
    ) -> Result<ApiResponse, AppError> {
        self.ensure_valid_token(false).await?;

        let url = self.platform_endpoint(&["api", "v1", "ingest", "jobs", job_id])?;
        let body = serde_json::to_vec(&UpdateJobStateRequest { state })
            .map_err(|e| AppError::Internal(format!("Failed to serialize job state: {}", e)))?;

        info!(
            "[JOBS] PATCH /jobs/{} ({})",
            redact_id(job_id),
            state.as_str()
        );

        self.send_authed(operation, Method::PATCH, url, Payload::Json(body), StatusCode::OK)
            .await
    }
}

/// Redacts an ID for logging (shows first 8 chars only).
pub(crate) fn redact_id(id: &str) -> String {
    match id.char_indices().nth(8) {
        Some((end, _)) => format!("{}...", &id[..end]),
        None => id.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
