use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;

use reqwest::StatusCode;
use thiserror::Error;

use crate::response::Response;

/// Why a [`Context`](crate::context::Context) stopped accepting work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The caller cancelled the operation.
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline (or a per-try timeout derived from it) elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// The category of failure behind an [`Error`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The call was cancelled or ran past its deadline.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The HTTP request failed at the transport level.
    #[error("Request error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Authentication failed. Never retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A credential could not be constructed or used in this environment. Never retried.
    #[error("{credential}: {message}")]
    CredentialUnavailable { credential: String, message: String },

    /// The service returned an error status without a structured error body.
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// The service returned a structured `{"error": {...}}` body.
    #[error("API error ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request body could not be read or rewound.
    #[error("Request body error: {0}")]
    Body(#[from] std::io::Error),

    /// A URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The endpoint URL is unusable.
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A header name or value is not valid HTTP.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// A required configuration value is missing.
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    /// A failure specific to one policy (for example resource provider registration).
    #[error(transparent)]
    Policy(Box<dyn std::error::Error + Send + Sync>),
}

/// The error type returned from every pipeline operation.
///
/// Wraps an [`ErrorKind`] together with the HTTP [`Response`] when one was
/// available, the source location where the error was raised, and a
/// backtrace (captured when `RUST_BACKTRACE` is set).
pub struct Error {
    kind: ErrorKind,
    response: Option<Box<Response>>,
    retriable: bool,
    location: &'static Location<'static>,
    backtrace: Backtrace,
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error of the given kind, recording the caller's location.
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        let retriable = !matches!(
            kind,
            ErrorKind::Authentication(_) | ErrorKind::CredentialUnavailable { .. }
        );
        Self {
            kind,
            response: None,
            retriable,
            location: Location::caller(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an error that the retry policy must not retry.
    #[track_caller]
    pub fn non_retriable(kind: ErrorKind) -> Self {
        let mut err = Self::new(kind);
        err.retriable = false;
        err
    }

    /// Wrap a policy-specific error.
    #[track_caller]
    pub fn policy(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::new(ErrorKind::Policy(err.into()))
    }

    /// Attach the HTTP response that accompanied this failure.
    #[must_use]
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    /// Mark this error as non-retriable.
    #[must_use]
    pub fn into_non_retriable(mut self) -> Self {
        self.retriable = false;
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The HTTP response that accompanied this failure, if any.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }

    /// Detach the HTTP response from this error.
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take().map(|r| *r)
    }

    /// The HTTP status code of the failure, from the attached response or the service error.
    pub fn status(&self) -> Option<StatusCode> {
        if let Some(response) = &self.response {
            return Some(response.status());
        }
        match &self.kind {
            ErrorKind::Http { status, .. } | ErrorKind::Api { status, .. } => {
                StatusCode::from_u16(*status).ok()
            }
            _ => None,
        }
    }

    /// Whether the retry policy may attempt the request again after this error.
    pub fn is_retriable(&self) -> bool {
        self.retriable
    }

    /// The cancellation or deadline error behind this failure, searching the whole source chain.
    pub fn context_error(&self) -> Option<ContextError> {
        if let ErrorKind::Context(err) = &self.kind {
            return Some(*err);
        }
        let mut current = std::error::Error::source(&self.kind);
        while let Some(err) = current {
            if let Some(ctx_err) = err.downcast_ref::<ContextError>() {
                return Some(*ctx_err);
            }
            // A transparent `Context` kind hides the `ContextError` from `source()`.
            if let Some(inner) = err.downcast_ref::<Error>() {
                return inner.context_error();
            }
            current = err.source();
        }
        None
    }

    pub fn is_cancelled(&self) -> bool {
        self.context_error() == Some(ContextError::Cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.context_error() == Some(ContextError::DeadlineExceeded)
    }

    /// Borrow the policy-specific error of type `T`, if that is what this error wraps.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match &self.kind {
            ErrorKind::Policy(inner) => inner.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Where the error was raised.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("response", &self.response)
            .field("retriable", &self.retriable)
            .field("location", &format_args!("{}", self.location))
            .finish_non_exhaustive()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

macro_rules! impl_from_for_error {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for Error {
                #[track_caller]
                fn from(err: $source) -> Self {
                    Self::new(ErrorKind::from(err))
                }
            }
        )*
    };
}

impl_from_for_error!(
    ContextError,
    reqwest::Error,
    std::io::Error,
    url::ParseError,
    serde_json::Error,
);

impl From<ErrorKind> for Error {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Maximum length for error messages to prevent sensitive data leaks.
pub(crate) const MAX_ERROR_MESSAGE_LEN: usize = 1000;

const REDACTED: &str = "[REDACTED]";

fn is_token_delimiter(c: char) -> bool {
    c.is_whitespace() || c == '"' || c == '\'' || c == ','
}

/// Remove bearer tokens and `sk-` style keys from a message.
pub(crate) fn sanitize_message(msg: &str) -> String {
    let mut result = msg.to_string();

    let mut search_start = 0;
    while let Some(relative_pos) = result[search_start..].find("Bearer ") {
        let token_start = search_start + relative_pos + "Bearer ".len();
        if token_start >= result.len() {
            break;
        }
        if result[token_start..].starts_with(REDACTED) {
            search_start = token_start + REDACTED.len();
            continue;
        }
        let token_end = result[token_start..]
            .find(is_token_delimiter)
            .map_or(result.len(), |pos| token_start + pos);
        if token_end > token_start {
            result.replace_range(token_start..token_end, REDACTED);
            search_start = token_start + REDACTED.len();
        } else {
            search_start = token_start;
        }
    }

    search_start = 0;
    while let Some(relative_pos) = result[search_start..].find("sk-") {
        let key_start = search_start + relative_pos;
        let key_end = result[key_start..]
            .find(is_token_delimiter)
            .map_or(result.len(), |pos| key_start + pos);
        if key_end > key_start + 3 {
            result.replace_range(key_start..key_end, REDACTED);
            search_start = key_start + REDACTED.len();
        } else {
            search_start = key_start + 3;
        }
    }

    result
}

/// Sanitize, then truncate a message to [`MAX_ERROR_MESSAGE_LEN`] bytes.
pub(crate) fn truncate_message(msg: &str) -> String {
    let sanitized = sanitize_message(msg);
    if sanitized.len() <= MAX_ERROR_MESSAGE_LEN {
        return sanitized;
    }
    let mut cut = MAX_ERROR_MESSAGE_LEN;
    while !sanitized.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &sanitized[..cut])
}
