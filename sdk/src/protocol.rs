//! Provider RPC wire protocol
//!
//! Requests and responses are exchanged as newline-delimited JSON over a
//! stream socket. Every request carries an id that the matching responses
//! echo. A `fetch` request is answered by any number of `progress` responses
//! followed by exactly one `fetch_complete` or `error`.

use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::types::{
    ConfigureRequest, FetchProgress, FetchSummary, ProviderConfiguration, ProviderSchema,
};

/// Version of the wire protocol spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// A call to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    GetSchema,
    GetConfiguration,
    Configure {
        request: ConfigureRequest,
    },
    Fetch {
        resources: Vec<String>,
        /// Remaining time the caller is willing to wait, if bounded
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline_ms: Option<u64>,
    },
}

impl Request {
    /// Method name used in logs and errors
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetSchema => "get_schema",
            Self::GetConfiguration => "get_configuration",
            Self::Configure { .. } => "configure",
            Self::Fetch { .. } => "fetch",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Failure categories a provider can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    DeadlineExceeded,
    InvalidRequest,
    NotConfigured,
    FetchFailed,
    Internal,
}

/// Error payload of an `error` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub code: FailureCode,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ProviderError> for RpcFailure {
    fn from(err: &ProviderError) -> Self {
        let code = match err {
            ProviderError::UnknownResource(_) => FailureCode::InvalidRequest,
            ProviderError::NotConfigured => FailureCode::NotConfigured,
            ProviderError::Resource { .. } | ProviderError::Store(_) => FailureCode::FetchFailed,
            ProviderError::Internal(_) => FailureCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

/// A reply from a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Schema { schema: ProviderSchema },
    Configuration { configuration: ProviderConfiguration },
    Configured,
    Progress { progress: FetchProgress },
    FetchComplete { summary: FetchSummary },
    Error { error: RpcFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub response: Response,
}

/// Encode a message as a single JSON line including the trailing newline
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}
