//! Error types: wire-level service error codes, the emulator's `StorageError`,
//! and the client-facing `BlobError` taxonomy.

use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;

use crate::transport::{ResponseBody, TransportError, TransportResponse};

/// Blob service error codes, as carried in `x-ms-error-code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // General errors
    ConditionNotMet,
    EmptyMetadataKey,
    InternalError,
    InvalidHeaderValue,
    InvalidMd5,
    InvalidMetadata,
    InvalidQueryParameterValue,
    InvalidRange,
    InvalidResourceName,
    InvalidXmlDocument,
    Md5Mismatch,
    MissingRequiredHeader,
    MissingRequiredQueryParameter,
    OperationTimedOut,
    OutOfRangeInput,
    ResourceNotFound,
    ServerBusy,
    UnsupportedHttpVerb,

    // Blob-specific errors
    BlobAlreadyExists,
    BlobNotFound,
    CannotVerifyCopySource,
    ContainerAlreadyExists,
    ContainerNotFound,
    InvalidBlobOrBlock,
    InvalidBlobTier,
    InvalidBlockId,
    InvalidBlockList,
    InvalidSourceBlobUrl,
    InvalidTag,
    LeaseAlreadyPresent,
    LeaseIdMismatchWithBlobOperation,
    LeaseIdMismatchWithContainerOperation,
    LeaseIdMismatchWithLeaseOperation,
    LeaseIdMissing,
    LeaseIsBreakingAndCannotBeAcquired,
    LeaseIsBreakingAndCannotBeChanged,
    LeaseIsBrokenAndCannotBeRenewed,
    LeaseLost,
    LeaseNotPresentWithBlobOperation,
    LeaseNotPresentWithContainerOperation,
    LeaseNotPresentWithLeaseOperation,
}

impl ErrorCode {
    const ALL: &'static [ErrorCode] = &[
        ErrorCode::ConditionNotMet,
        ErrorCode::EmptyMetadataKey,
        ErrorCode::InternalError,
        ErrorCode::InvalidHeaderValue,
        ErrorCode::InvalidMd5,
        ErrorCode::InvalidMetadata,
        ErrorCode::InvalidQueryParameterValue,
        ErrorCode::InvalidRange,
        ErrorCode::InvalidResourceName,
        ErrorCode::InvalidXmlDocument,
        ErrorCode::Md5Mismatch,
        ErrorCode::MissingRequiredHeader,
        ErrorCode::MissingRequiredQueryParameter,
        ErrorCode::OperationTimedOut,
        ErrorCode::OutOfRangeInput,
        ErrorCode::ResourceNotFound,
        ErrorCode::ServerBusy,
        ErrorCode::UnsupportedHttpVerb,
        ErrorCode::BlobAlreadyExists,
        ErrorCode::BlobNotFound,
        ErrorCode::CannotVerifyCopySource,
        ErrorCode::ContainerAlreadyExists,
        ErrorCode::ContainerNotFound,
        ErrorCode::InvalidBlobOrBlock,
        ErrorCode::InvalidBlobTier,
        ErrorCode::InvalidBlockId,
        ErrorCode::InvalidBlockList,
        ErrorCode::InvalidSourceBlobUrl,
        ErrorCode::InvalidTag,
        ErrorCode::LeaseAlreadyPresent,
        ErrorCode::LeaseIdMismatchWithBlobOperation,
        ErrorCode::LeaseIdMismatchWithContainerOperation,
        ErrorCode::LeaseIdMismatchWithLeaseOperation,
        ErrorCode::LeaseIdMissing,
        ErrorCode::LeaseIsBreakingAndCannotBeAcquired,
        ErrorCode::LeaseIsBreakingAndCannotBeChanged,
        ErrorCode::LeaseIsBrokenAndCannotBeRenewed,
        ErrorCode::LeaseLost,
        ErrorCode::LeaseNotPresentWithBlobOperation,
        ErrorCode::LeaseNotPresentWithContainerOperation,
        ErrorCode::LeaseNotPresentWithLeaseOperation,
    ];

    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConditionNotMet => "ConditionNotMet",
            ErrorCode::EmptyMetadataKey => "EmptyMetadataKey",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::InvalidHeaderValue => "InvalidHeaderValue",
            ErrorCode::InvalidMd5 => "InvalidMd5",
            ErrorCode::InvalidMetadata => "InvalidMetadata",
            ErrorCode::InvalidQueryParameterValue => "InvalidQueryParameterValue",
            ErrorCode::InvalidRange => "InvalidRange",
            ErrorCode::InvalidResourceName => "InvalidResourceName",
            ErrorCode::InvalidXmlDocument => "InvalidXmlDocument",
            ErrorCode::Md5Mismatch => "Md5Mismatch",
            ErrorCode::MissingRequiredHeader => "MissingRequiredHeader",
            ErrorCode::MissingRequiredQueryParameter => "MissingRequiredQueryParameter",
            ErrorCode::OperationTimedOut => "OperationTimedOut",
            ErrorCode::OutOfRangeInput => "OutOfRangeInput",
            ErrorCode::ResourceNotFound => "ResourceNotFound",
            ErrorCode::ServerBusy => "ServerBusy",
            ErrorCode::UnsupportedHttpVerb => "UnsupportedHttpVerb",
            ErrorCode::BlobAlreadyExists => "BlobAlreadyExists",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::CannotVerifyCopySource => "CannotVerifyCopySource",
            ErrorCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorCode::ContainerNotFound => "ContainerNotFound",
            ErrorCode::InvalidBlobOrBlock => "InvalidBlobOrBlock",
            ErrorCode::InvalidBlobTier => "InvalidBlobTier",
            ErrorCode::InvalidBlockId => "InvalidBlockId",
            ErrorCode::InvalidBlockList => "InvalidBlockList",
            ErrorCode::InvalidSourceBlobUrl => "InvalidSourceBlobUrl",
            ErrorCode::InvalidTag => "InvalidTag",
            ErrorCode::LeaseAlreadyPresent => "LeaseAlreadyPresent",
            ErrorCode::LeaseIdMismatchWithBlobOperation => "LeaseIdMismatchWithBlobOperation",
            ErrorCode::LeaseIdMismatchWithContainerOperation => {
                "LeaseIdMismatchWithContainerOperation"
            }
            ErrorCode::LeaseIdMismatchWithLeaseOperation => "LeaseIdMismatchWithLeaseOperation",
            ErrorCode::LeaseIdMissing => "LeaseIdMissing",
            ErrorCode::LeaseIsBreakingAndCannotBeAcquired => "LeaseIsBreakingAndCannotBeAcquired",
            ErrorCode::LeaseIsBreakingAndCannotBeChanged => "LeaseIsBreakingAndCannotBeChanged",
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed => "LeaseIsBrokenAndCannotBeRenewed",
            ErrorCode::LeaseLost => "LeaseLost",
            ErrorCode::LeaseNotPresentWithBlobOperation => "LeaseNotPresentWithBlobOperation",
            ErrorCode::LeaseNotPresentWithContainerOperation => {
                "LeaseNotPresentWithContainerOperation"
            }
            ErrorCode::LeaseNotPresentWithLeaseOperation => "LeaseNotPresentWithLeaseOperation",
        }
    }

    /// Parses a wire error code. Unknown codes yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_str() == value)
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ErrorCode::EmptyMetadataKey
            | ErrorCode::InvalidHeaderValue
            | ErrorCode::InvalidMd5
            | ErrorCode::InvalidMetadata
            | ErrorCode::InvalidQueryParameterValue
            | ErrorCode::InvalidResourceName
            | ErrorCode::InvalidXmlDocument
            | ErrorCode::Md5Mismatch
            | ErrorCode::MissingRequiredHeader
            | ErrorCode::MissingRequiredQueryParameter
            | ErrorCode::OutOfRangeInput
            | ErrorCode::UnsupportedHttpVerb
            | ErrorCode::InvalidBlobOrBlock
            | ErrorCode::InvalidBlobTier
            | ErrorCode::InvalidBlockId
            | ErrorCode::InvalidBlockList
            | ErrorCode::InvalidSourceBlobUrl
            | ErrorCode::InvalidTag => StatusCode::BAD_REQUEST,

            // 404 Not Found
            ErrorCode::BlobNotFound
            | ErrorCode::ContainerNotFound
            | ErrorCode::ResourceNotFound
            | ErrorCode::CannotVerifyCopySource => StatusCode::NOT_FOUND,

            // 409 Conflict
            ErrorCode::BlobAlreadyExists
            | ErrorCode::ContainerAlreadyExists
            | ErrorCode::LeaseAlreadyPresent
            | ErrorCode::LeaseIdMismatchWithBlobOperation
            | ErrorCode::LeaseIdMismatchWithContainerOperation
            | ErrorCode::LeaseIdMismatchWithLeaseOperation
            | ErrorCode::LeaseIsBreakingAndCannotBeAcquired
            | ErrorCode::LeaseIsBreakingAndCannotBeChanged
            | ErrorCode::LeaseIsBrokenAndCannotBeRenewed
            | ErrorCode::LeaseLost
            | ErrorCode::LeaseNotPresentWithBlobOperation
            | ErrorCode::LeaseNotPresentWithContainerOperation
            | ErrorCode::LeaseNotPresentWithLeaseOperation => StatusCode::CONFLICT,

            // 412 Precondition Failed
            ErrorCode::ConditionNotMet | ErrorCode::LeaseIdMissing => {
                StatusCode::PRECONDITION_FAILED
            }

            // 416 Range Not Satisfiable
            ErrorCode::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,

            // 500 Internal Server Error
            ErrorCode::InternalError | ErrorCode::OperationTimedOut => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            // 503 Service Unavailable
            ErrorCode::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::BlobNotFound => "The specified blob does not exist.",
            ErrorCode::BlobAlreadyExists => "The specified blob already exists.",
            ErrorCode::ConditionNotMet => "The condition specified using HTTP conditional header(s) is not met.",
            ErrorCode::ContainerAlreadyExists => "The specified container already exists.",
            ErrorCode::ContainerNotFound => "The specified container does not exist.",
            ErrorCode::InvalidBlockId => "The specified block ID is invalid.",
            ErrorCode::InvalidBlockList => "The specified block list is invalid.",
            ErrorCode::InvalidHeaderValue => "The value for one of the HTTP headers is not valid.",
            ErrorCode::InvalidRange => "The range specified is invalid for the current size of the resource.",
            ErrorCode::InvalidResourceName => "The specified resource name contains invalid characters.",
            ErrorCode::InvalidXmlDocument => "The XML request body is invalid.",
            ErrorCode::LeaseAlreadyPresent => "There is already a lease present.",
            ErrorCode::LeaseIdMissing => "There is currently a lease on the resource and no lease ID was specified in the request.",
            ErrorCode::LeaseLost => "A lease ID was specified, but the lease for the resource has expired.",
            ErrorCode::Md5Mismatch => "The MD5 value specified in the request did not match the MD5 value calculated by the server.",
            ErrorCode::MissingRequiredHeader => "A required header was not specified.",
            ErrorCode::MissingRequiredQueryParameter => "A required query parameter was not specified.",
            ErrorCode::ResourceNotFound => "The specified resource does not exist.",
            ErrorCode::ServerBusy => "The server is currently unable to receive requests. Please retry your request.",
            ErrorCode::InternalError => "The server encountered an internal error. Please retry the request.",
            _ => "An error occurred while processing the request.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emulator-side error with code and message.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl StorageError {
    /// Creates a new storage error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            request_id: None,
        }
    }

    /// Creates a new storage error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Sets the request ID for this error.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Converts the error to an XML error response body.
    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><Error><Code>{}</Code><Message>{}</Message></Error>"#,
            self.code.as_str(),
            crate::xml::escape(&self.message)
        )
    }

    /// Renders the error the way the service does: status, `x-ms-error-code`
    /// and an XML body.
    pub fn into_response(self) -> TransportResponse {
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = self.to_xml();

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/xml"));
        headers.insert("x-ms-error-code", HeaderValue::from_static(self.code.as_str()));
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-ms-request-id", value);
        }

        TransportResponse {
            status: self.code.status_code(),
            headers,
            body: ResponseBody::from_bytes(body.into()),
        }
    }
}

impl From<crate::xml::XmlError> for StorageError {
    fn from(err: crate::xml::XmlError) -> Self {
        StorageError::with_message(ErrorCode::InvalidXmlDocument, err.to_string())
    }
}

/// Result type alias for emulator operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by client operations.
///
/// Every variant that originates from a request names the operation and the
/// resource path it was addressed to.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("{operation} on {resource}: transport failure: {source}")]
    Transport {
        operation: &'static str,
        resource: String,
        #[source]
        source: TransportError,
    },

    #[error("{operation} on {resource}: service returned {status} ({code}): {message}")]
    Service {
        operation: &'static str,
        resource: String,
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("transfer of {resource} failed: {reason}")]
    Transfer {
        resource: String,
        reason: String,
        #[source]
        source: Option<Box<BlobError>>,
    },

    #[error("{operation} on {resource}: lease conflict ({code})")]
    LeaseConflict {
        operation: &'static str,
        resource: String,
        code: ErrorCode,
    },

    #[error("{operation} on {resource}: lease lost ({code})")]
    LeaseLost {
        operation: &'static str,
        resource: String,
        code: ErrorCode,
    },

    #[error("{operation} on {resource}: precondition failed (etag {etag:?})")]
    PreconditionFailed {
        operation: &'static str,
        resource: String,
        etag: Option<String>,
    },

    #[error("tag query syntax error at byte {position}: {message} in {expression:?}")]
    QuerySyntax {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("{operation}: {resource} not found ({code})")]
    NotFound {
        operation: &'static str,
        resource: String,
        code: String,
    },

    #[error("{operation}: {resource} already exists ({code})")]
    AlreadyExists {
        operation: &'static str,
        resource: String,
        code: String,
    },

    #[error("{operation} on {resource}: malformed response: {message}")]
    MalformedResponse {
        operation: &'static str,
        resource: String,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{operation} on {resource} was cancelled")]
    Cancelled {
        operation: &'static str,
        resource: String,
    },
}

impl BlobError {
    /// Whether a single request that failed this way may be re-sent.
    pub fn is_retryable(&self) -> bool {
        match self {
            BlobError::Transport { .. } => true,
            BlobError::Service { status, code, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || code == ErrorCode::ServerBusy.as_str()
                    || code == ErrorCode::OperationTimedOut.as_str()
            }
            _ => false,
        }
    }

    /// The service error code carried by this error, if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            BlobError::Service { code, .. }
            | BlobError::NotFound { code, .. }
            | BlobError::AlreadyExists { code, .. } => Some(code),
            BlobError::LeaseConflict { code, .. } | BlobError::LeaseLost { code, .. } => {
                Some(code.as_str())
            }
            BlobError::PreconditionFailed { .. } => Some(ErrorCode::ConditionNotMet.as_str()),
            _ => None,
        }
    }

    pub(crate) fn transfer(
        resource: impl Into<String>,
        reason: impl Into<String>,
        source: Option<BlobError>,
    ) -> Self {
        BlobError::Transfer {
            resource: resource.into(),
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }

    pub(crate) fn malformed(
        operation: &'static str,
        resource: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        BlobError::MalformedResponse {
            operation,
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

/// Builds a `BlobError` from a non-success response.
///
/// The code comes from `x-ms-error-code`, then the `<Code>` element of the XML
/// body, then the status alone.
pub(crate) fn classify_response(
    operation: &'static str,
    resource: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    etag: Option<&str>,
) -> BlobError {
    let body_text = String::from_utf8_lossy(body);
    let code = headers
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| crate::xml::deserialize::parse_error_code(&body_text))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").replace(' ', ""));
    let message = crate::xml::deserialize::parse_error_message(&body_text)
        .unwrap_or_else(|| code.clone());
    let resource = resource.to_string();

    match ErrorCode::parse(&code) {
        Some(
            c @ (ErrorCode::LeaseAlreadyPresent
            | ErrorCode::LeaseIsBreakingAndCannotBeAcquired
            | ErrorCode::LeaseIsBreakingAndCannotBeChanged
            | ErrorCode::LeaseIdMissing),
        ) => BlobError::LeaseConflict {
            operation,
            resource,
            code: c,
        },
        Some(
            c @ (ErrorCode::LeaseLost
            | ErrorCode::LeaseIdMismatchWithBlobOperation
            | ErrorCode::LeaseIdMismatchWithContainerOperation
            | ErrorCode::LeaseIdMismatchWithLeaseOperation
            | ErrorCode::LeaseIsBrokenAndCannotBeRenewed
            | ErrorCode::LeaseNotPresentWithBlobOperation
            | ErrorCode::LeaseNotPresentWithContainerOperation
            | ErrorCode::LeaseNotPresentWithLeaseOperation),
        ) => BlobError::LeaseLost {
            operation,
            resource,
            code: c,
        },
        Some(ErrorCode::ConditionNotMet) => BlobError::PreconditionFailed {
            operation,
            resource,
            etag: etag.map(String::from),
        },
        Some(
            ErrorCode::BlobNotFound | ErrorCode::ContainerNotFound | ErrorCode::ResourceNotFound,
        ) => BlobError::NotFound {
            operation,
            resource,
            code,
        },
        Some(ErrorCode::BlobAlreadyExists | ErrorCode::ContainerAlreadyExists) => {
            BlobError::AlreadyExists {
                operation,
                resource,
                code,
            }
        }
        _ if status == StatusCode::PRECONDITION_FAILED || status == StatusCode::NOT_MODIFIED => {
            BlobError::PreconditionFailed {
                operation,
                resource,
                etag: etag.map(String::from),
            }
        }
        _ if status == StatusCode::NOT_FOUND => BlobError::NotFound {
            operation,
            resource,
            code,
        },
        _ => BlobError::Service {
            operation,
            resource,
            status,
            code,
            message,
        },
    }
}

/// Result type alias for client operations.
pub type BlobResult<T> = Result<T, BlobError>;
