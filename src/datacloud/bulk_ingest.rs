//! Bulk ingestion of CSV files.
//!
//! This module provides functionality to:
//! - Create bulk ingest jobs (upsert, delete)
//! - Split local CSV files into upload fragments and stream each one to the job
//! - Close the job, or abort it when any step fails
//!
//! # Security
//!
//! - Raw CSV contents are never logged
//! - Auth headers and tokens are never logged
//! - Job ids are truncated in log lines

use std::path::{Path, PathBuf};

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::chunking::{stream_fragments, ChunkConfig};
use crate::datacloud::client::Payload;
use crate::datacloud::jobs::redact_id;
use crate::datacloud::{DataCloudClient, JobInfo, JobState};
use crate::error::{ApiOperation, AppError};

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Bulk ingest operation type.
///
/// Serialized lowercase (`"upsert"`, `"delete"`) as the API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    /// Insert or update rows by primary key.
    Upsert,
    /// Delete rows by primary key.
    Delete,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Upsert => "upsert",
            BulkOperation::Delete => "delete",
        }
    }
}

/// Request body for creating an ingest job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest<'a> {
    object: &'a str,
    source_name: &'a str,
    operation: BulkOperation,
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

impl DataCloudClient {
    /// Upserts the rows of one or more CSV files through a single bulk job.
    ///
    /// # Arguments
    ///
    /// * `source_name` - Ingest API connector name
    /// * `object_name` - Object (resource type) within the connector
    /// * `files` - CSV files to upload, in order
    ///
    /// # Returns
    ///
    /// The id of the closed job.
    ///
    /// # Errors
    ///
    /// Any failure after the job was created aborts the job (best-effort)
    /// before the original error is returned.
    pub async fn bulk_upsert<I, P>(
        &mut self,
        source_name: &str,
        object_name: &str,
        files: I,
    ) -> Result<String, AppError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.run_bulk_operation(source_name, object_name, BulkOperation::Upsert, files)
            .await
    }

    /// Deletes the rows listed in one or more CSV files through a single bulk job.
    ///
    /// Same job lifecycle and error behavior as [`DataCloudClient::bulk_upsert`].
    pub async fn bulk_delete<I, P>(
        &mut self,
        source_name: &str,
        object_name: &str,
        files: I,
    ) -> Result<String, AppError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.run_bulk_operation(source_name, object_name, BulkOperation::Delete, files)
            .await
    }

    /// Creates a job, uploads every file and closes the job.
    ///
    /// The job id is released only after a successful close. Every other
    /// exit after creation sends one abort, whose own failure is logged and
    /// dropped so the original error reaches the caller.
    pub async fn run_bulk_operation<I, P>(
        &mut self,
        source_name: &str,
        object_name: &str,
        operation: BulkOperation,
        files: I,
    ) -> Result<String, AppError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let files: Vec<PathBuf> = files
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();

        let job_id = self
            .create_job(source_name, object_name, operation)
            .await?;

        match self.upload_and_close(&job_id, &files).await {
            Ok(()) => {
                info!(
                    "[BULK-INGEST] Job {} closed after {} files",
                    redact_id(&job_id),
                    files.len()
                );
                Ok(job_id)
            }
            Err(e) => {
                warn!(
                    "[BULK-INGEST] Job {} failed, aborting: {}",
                    redact_id(&job_id),
                    e.sanitized()
                );
                if let Err(abort_err) = self
                    .update_job_state(&job_id, JobState::Aborted, ApiOperation::AbortJob)
                    .await
                {
                    warn!(
                        "[BULK-INGEST] Abort of job {} failed: {}",
                        redact_id(&job_id),
                        abort_err.sanitized()
                    );
                }
                Err(e)
            }
        }
    }

    /// Creates a bulk ingest job.
    ///
    /// # Returns
    ///
    /// The job id on success.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - The service did not answer with 201
    /// - `AppError::InvalidResponse` - The body carried no job id
    pub async fn create_job(
        &mut self,
        source_name: &str,
        object_name: &str,
        operation: BulkOperation,
    ) -> Result<String, AppError> {
        self.ensure_valid_token(false).await?;

        let url = self.platform_endpoint(&["api", "v1", "ingest", "jobs"])?;
        let body = serde_json::to_vec(&CreateJobRequest {
            object: object_name,
            source_name,
            operation,
        })
        .map_err(|e| AppError::Internal(format!("Failed to serialize job request: {}", e)))?;

        info!(
            "[BULK-INGEST] POST /jobs (creating {} job for {}/{})",
            operation.as_str(),
            source_name,
            object_name
        );

        let response = self
            .send_authed(
                ApiOperation::CreateJob,
                Method::POST,
                url,
                Payload::Json(body),
                StatusCode::CREATED,
            )
            .await?;

        let job: JobInfo = response.json(ApiOperation::CreateJob)?;
        info!("[BULK-INGEST] Created job {}", redact_id(&job.id));
        Ok(job.id)
    }

    /// Streams one CSV fragment to the job via PUT.
    ///
    /// The file goes from disk to the network without being loaded into memory.
    ///
    /// # Errors
    ///
    /// - `AppError::Io` - The file could not be opened
    /// - `AppError::Api` - The service did not answer with 202
    pub async fn upload_job_data(&mut self, job_id: &str, csv_path: &Path) -> Result<(), AppError> {
        self.ensure_valid_token(false).await?;

        let url = self.platform_endpoint(&["api", "v1", "ingest", "jobs", job_id, "batches"])?;

        let file = tokio::fs::File::open(csv_path)
            .await
            .map_err(|e| AppError::Io(format!("Failed to open CSV fragment: {}", e)))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| AppError::Io(format!("Failed to get file metadata: {}", e)))?
            .len();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        info!(
            "[BULK-INGEST] PUT /jobs/{}/batches ({} bytes)",
            redact_id(job_id),
            file_size
        );

        self.send_authed(
            ApiOperation::UploadFile,
            Method::PUT,
            url,
            Payload::Csv(body),
            StatusCode::ACCEPTED,
        )
        .await?;

        Ok(())
    }

    /// Marks the job upload complete so the service starts processing.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - The service did not answer with 200
    pub async fn close_job(&mut self, job_id: &str) -> Result<(), AppError> {
        self.update_job_state(job_id, JobState::UploadComplete, ApiOperation::CloseJob)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn upload_and_close(&mut self, job_id: &str, files: &[PathBuf]) -> Result<(), AppError> {
        for file in files {
            self.upload_file(job_id, file).await?;
        }
        self.close_job(job_id).await
    }

    /// Splits one source file and uploads its fragments in order.
    ///
    /// Fragments live in a scoped directory under the configured temp dir.
    /// Each is uploaded and removed before the splitter cuts the next one;
    /// the directory takes any leftovers with it when dropped.
    async fn upload_file(&mut self, job_id: &str, source: &Path) -> Result<(), AppError> {
        info!("[BULK-INGEST] Processing file {}", source.display());

        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| AppError::Io(format!("Failed to create temp directory: {}", e)))?;
        let scratch = tempfile::Builder::new()
            .prefix("datacloud-bulk-")
            .tempdir_in(&self.config.temp_dir)
            .map_err(|e| AppError::Io(format!("Failed to create scratch directory: {}", e)))?;

        let chunk_config = ChunkConfig::default()
            .max_bytes(self.config.bulk_max_payload_bytes)
            .encoding(self.config.input_encoding);
        let mut fragments = stream_fragments(source, scratch.path(), chunk_config);
        let mut uploaded = 0usize;

        while let Some(fragment) = fragments.next().await {
            info!(
                "[BULK-INGEST] Uploading fragment {} ({} rows)",
                fragment.path.display(),
                fragment.rows
            );

            if let Err(e) = self.upload_fragment(job_id, &fragment.path).await {
                // Dropping the fragment stops the splitter; its own error is secondary
                drop(fragment);
                let _ = fragments.finish().await;
                return Err(e);
            }

            fragment.release();
            uploaded += 1;
        }

        let total_rows = fragments.finish().await?;

        if uploaded == 0 {
            warn!(
                "[BULK-INGEST] {} has no data rows, nothing uploaded",
                source.display()
            );
        } else {
            info!(
                "[BULK-INGEST] Uploaded {} rows of {} in {} fragments",
                total_rows,
                source.display(),
                uploaded
            );
        }

        Ok(())
    }

    async fn upload_fragment(&mut self, job_id: &str, fragment: &Path) -> Result<(), AppError> {
        self.upload_job_data(job_id, fragment).await?;
        tokio::fs::remove_file(fragment)
            .await
            .map_err(|e| AppError::Io(format!("Failed to remove uploaded fragment: {}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
