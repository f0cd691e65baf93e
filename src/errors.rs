//!
//! src/errors.rs
//!
//! Defines enums and methods of error conversion
//! for errors the reconciliation pipeline uses
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("capability error: {0}")]
    Capability(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self { PipelineError::Http(e.to_string()) }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self { PipelineError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self { PipelineError::Db(e.to_string()) }
}
