use crate::StatusCode;
use std::{fmt, io};
use thiserror::Error;

/// Malformed input on the wire. The connection is dropped without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUri,
    #[error("invalid or unsupported protocol version")]
    InvalidVersion,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("header block exceeds the configured size")]
    HeaderTooLarge,
    #[error("peer closed the connection")]
    ConnectionClosed,
}

/// Every failure the server can observe while serving a request.
///
/// Handlers return it from [`Handler::handle`](crate::Handler::handle); the
/// dispatcher turns it into an error page with [`ErrorKind::status`].
#[derive(Debug, PartialEq, Error)]
pub enum ErrorKind {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("the route expects a body but `content-length` is missing")]
    BodyMissingLength,
    #[error("the body is larger than {0} bytes")]
    BodySoLong(usize),
    #[error("the body does not match the route mask")]
    BodyMaskValidationFailed,
    #[error("the `content-type` header is missing")]
    ContentTypeMissing,
    #[error("the multipart `boundary` parameter is missing")]
    BoundaryMissing,
    #[error("cannot parse the body: {0}")]
    BodyParse(String),
    #[error("the route parameter `{0}` is missing")]
    ParamMissing(String),
    #[error("a simple form field follows a file part")]
    SimpleParamAfterFile,

    #[error("file i/o: {0}")]
    FileIo(IoError),
    #[error("socket i/o: {0}")]
    Io(IoError),

    #[error("engine failure: {0}")]
    Engine(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("response conflict: {0}")]
    ResponseConflict(&'static str),

    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("{1}")]
    Status(StatusCode, String),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident => $json:literal;)*) => {
        /// HTTP status used when this error reaches the dispatch boundary.
        pub fn status(&self) -> StatusCode {
            match self {
                $(Self::$name { .. } => StatusCode::$status,)*
                Self::Status(code, _) => *code,
            }
        }

        /// Body of the bare error response sent when no error page is registered
        /// and [`json_errors`](crate::limits::ServerLimits::json_errors) is on.
        pub(crate) fn as_json(&self) -> &'static str {
            match self {
                $(Self::$name { .. } => $json,)*
                Self::Status(..) => r#"{"error":"Request rejected","code":"REJECTED"}"#,
            }
        }
    };
}

impl ErrorKind {
    http_errors! {
        Protocol: BadRequest
            => r#"{"error":"Malformed request","code":"PROTOCOL"}"#;

        BodyMissingLength: LengthRequired
            => r#"{"error":"Content-Length required","code":"BODY_MISSING_LENGTH"}"#;
        BodySoLong: PayloadTooLarge
            => r#"{"error":"Request body too large","code":"BODY_SO_LONG"}"#;
        BodyMaskValidationFailed: BadRequest
            => r#"{"error":"Body failed validation","code":"BODY_MASK"}"#;
        ContentTypeMissing: BadRequest
            => r#"{"error":"Content-Type required","code":"CONTENT_TYPE_MISSING"}"#;
        BoundaryMissing: BadRequest
            => r#"{"error":"Multipart boundary required","code":"BOUNDARY_MISSING"}"#;
        BodyParse: BadRequest
            => r#"{"error":"Body cannot be parsed","code":"BODY_PARSE"}"#;
        ParamMissing: BadRequest
            => r#"{"error":"Route parameter missing","code":"PARAM_MISSING"}"#;
        SimpleParamAfterFile: BadRequest
            => r#"{"error":"Field after file part","code":"PARAM_AFTER_FILE"}"#;

        FileIo: InternalServerError
            => r#"{"error":"File cannot be read","code":"FILE_IO"}"#;
        Io: ServiceUnavailable
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;

        Engine: ServiceUnavailable
            => r#"{"error":"Transport failure","code":"ENGINE"}"#;
        Config: ServiceUnavailable
            => r#"{"error":"Server misconfigured","code":"CONFIG"}"#;
        ResponseConflict: ServiceUnavailable
            => r#"{"error":"Conflicting response options","code":"RESPONSE_CONFLICT"}"#;

        ServiceUnavailable: ServiceUnavailable
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
    }

    /// Shorthand for handlers that want a specific status with a message.
    pub fn with_status<M: Into<String>>(status: StatusCode, message: M) -> Self {
        ErrorKind::Status(status, message.into())
    }

    #[inline]
    pub(crate) fn file(err: io::Error) -> Self {
        ErrorKind::FileIo(IoError(err))
    }

    #[inline]
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Engine(_))
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(err: serde_json::Error) -> Self {
        ErrorKind::BodyParse(err.to_string())
    }
}

impl From<quiche::Error> for ErrorKind {
    fn from(err: quiche::Error) -> Self {
        ErrorKind::Engine(err.to_string())
    }
}

impl From<quiche::h3::Error> for ErrorKind {
    fn from(err: quiche::h3::Error) -> Self {
        ErrorKind::Engine(format!("h3: {err}"))
    }
}

impl From<rustls::Error> for ErrorKind {
    fn from(err: rustls::Error) -> Self {
        ErrorKind::Engine(format!("tls: {err}"))
    }
}

#[derive(Debug)]
pub struct IoError(pub(crate) io::Error);

impl IoError {
    #[inline]
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
