//! Typed errors for the seller API client

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token rejected for cabinet {cabinet} ({status})")]
    Unauthorized { cabinet: String, status: StatusCode },

    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to decode API response: {source}. Response: {preview}")]
    Decode {
        #[source]
        source: serde_json::Error,
        preview: String,
    },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ApiError {
    /// The cabinet's token is bad; further requests with it are pointless
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
