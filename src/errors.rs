use crate::{query, Version};
use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    UriTooLong,
    #[allow(dead_code)]
    Query(query::Error),

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    DuplicateContentLength,
    InvalidConnection,

    BodyTooLarge,
    #[allow(dead_code)]
    BodyMismatch {
        expected: usize,
        available: usize,
    },
    #[allow(dead_code)]
    UnexpectedBody(usize),
    BadChunk,

    OutOfPool,
    OutOfMemory,

    ReadError,
    WriteError,
    PeerAborted,
    TlsHandshakeFailed,
    TlsFatalAlert,

    AlreadyQueued,
    Frozen,
    WrongMode,
    TimeoutReached,

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        UriTooLong: "414 URI Too Long", "46"
            => r#"{"error":"URI too long","code":"URI_TOO_LONG"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        DuplicateContentLength: "400 Bad Request", "77"
            => r#"{"error":"Duplicate Content-Length header","code":"DUPLICATE_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        BodyMismatch: "400 Bad Request", "55"
            => r#"{"error":"Body length mismatch","code":"BODY_MISMATCH"}"#;
        UnexpectedBody: "400 Bad Request", "60"
            => r#"{"error":"Unexpected request body","code":"UNEXPECTED_BODY"}"#;
        BadChunk: "400 Bad Request", "53"
            => r#"{"error":"Malformed chunked body","code":"BAD_CHUNK"}"#;

        OutOfPool: "503 Service Unavailable", "58"
            => r#"{"error":"Connection pool exhausted","code":"OUT_OF_POOL"}"#;
        OutOfMemory: "503 Service Unavailable", "48"
            => r#"{"error":"Out of memory","code":"OUT_OF_MEMORY"}"#;

        ReadError: "400 Bad Request", "52"
            => r#"{"error":"Transport read error","code":"READ_ERROR"}"#;
        WriteError: "400 Bad Request", "54"
            => r#"{"error":"Transport write error","code":"WRITE_ERROR"}"#;
        PeerAborted: "400 Bad Request", "60"
            => r#"{"error":"Connection aborted by peer","code":"PEER_ABORTED"}"#;
        TlsHandshakeFailed: "400 Bad Request", "62"
            => r#"{"error":"TLS handshake failed","code":"TLS_HANDSHAKE_FAILED"}"#;
        TlsFatalAlert: "400 Bad Request", "52"
            => r#"{"error":"TLS fatal alert","code":"TLS_FATAL_ALERT"}"#;

        AlreadyQueued: "500 Internal Server Error", "59"
            => r#"{"error":"Response already queued","code":"ALREADY_QUEUED"}"#;
        Frozen: "500 Internal Server Error", "57"
            => r#"{"error":"Response frozen after enqueue","code":"FROZEN"}"#;
        WrongMode: "500 Internal Server Error", "52"
            => r#"{"error":"Daemon mode mismatch","code":"WRONG_MODE"}"#;
        TimeoutReached: "408 Request Timeout", "68"
            => r#"{"error":"Connection idle timeout reached","code":"TIMEOUT_REACHED"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
