//! Client library for the Salesforce Data Cloud ingestion and query APIs.
//!
//! ```no_run
//! use datacloud_client::{Config, DataCloudClient, ListJobsParams};
//!
//! # async fn run() -> Result<(), datacloud_client::AppError> {
//! let config = Config::load(Some("datacloud.yaml".as_ref()))?;
//! let mut client = DataCloudClient::new(config)?;
//!
//! let jobs = client.list_jobs(&ListJobsParams::default()).await?;
//! let result = client.query("SELECT ssot__Id__c FROM ssot__Individual__dlm").await?;
//! # let _ = (jobs, result);
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod config;
pub mod datacloud;
pub mod error;
pub mod state;

pub use config::{Config, InputEncoding};
pub use datacloud::{
    ApiResponse, BulkOperation, DataCloudClient, JobInfo, JobList, JobState, ListJobsParams,
    LoggingMode, QueryResult, Record,
};
pub use error::{ApiOperation, AppError};
