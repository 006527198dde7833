//! Core HTTP protocol types and lookup tables

use crate::errors::{ErrorKind, ProtocolError};

// TO LOWER CASE

#[rustfmt::skip]
const ASCII_TABLE: [u8; 256] = [
    //   x0    x1    x2    x3    x4    x5    x6    x7    x8    x9    xA    xB    xC    xD    xE    xF
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, // 0x
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, // 1x
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x2E, 0x2F, // 2x
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, // 3x
    0x40, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', b'm', b'n', b'o', // 4x
    b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y', b'z', 0x5B, 0x5C, 0x5D, 0x5E, 0x5F, // 5x
    0x60, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', b'm', b'n', b'o', // 6x
    b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y', b'z', 0x7B, 0x7C, 0x7D, 0x7E, 0x7F, // 7x
    0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x8B, 0x8C, 0x8D, 0x8E, 0x8F, // 8x
    0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F, // 9x
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, // Ax
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, // Bx
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF, // Cx
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF, // Dx
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF, // Ex
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF, // Fx
];

#[inline(always)]
pub(crate) fn to_lower_case(src: &mut [u8]) {
    for byte in src.iter_mut() {
        *byte = ASCII_TABLE[*byte as usize];
    }
}

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

#[inline(always)]
pub(crate) const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

// METHOD

/// HTTP request methods accepted by the router.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"POST" => Ok(Method::Post),
            b"PUT" => Ok(Method::Put),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            b"HEAD" => Ok(Method::Head),
            _ => Err(ProtocolError::InvalidMethod.into()),
        }
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
        }
    }

    /// Methods whose routes read a request body.
    #[inline]
    pub const fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

// VERSION

/// HTTP protocol version of the incoming request
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0, closes after each response unless `connection: keep-alive`
    Http10,
    /// HTTP/1.1, persistent by default
    Http11,
    /// HTTP/3 over QUIC
    Http3,
}

impl Version {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(ProtocolError::InvalidVersion.into()),
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes
        ///
        /// Each code carries its reason phrase, used on the HTTP/1.x status line.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, _) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Reason phrase, e.g. `"Not Found"`.
            #[inline]
            pub const fn message(&self) -> &'static str {
                match self { $(StatusCode::$name => $str,)+ }
            }

            /// Decimal code as text, used for the HTTP/3 `:status` pseudo-header.
            #[inline]
            pub(crate) const fn as_code_str(&self) -> &'static str {
                match self { $(StatusCode::$name => stringify!($num),)+ }
            }

            /// Looks up a code by number.
            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $($num => Some(StatusCode::$name),)+ _ => None }
            }
        }
    }
}

impl StatusCode {
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    ResetContent = (205, "Reset Content");
    /// Sent for byte-range file responses
    PartialContent = (206, "Partial Content");

    MultipleChoices = (300, "Multiple Choices");
    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    PaymentRequired = (402, "Payment Required");
    Forbidden = (403, "Forbidden");
    /// Sent when no route and no static file matched
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    ExpectationFailed = (417, "Expectation Failed");
    ImaTeapot = (418, "I'm a teapot");
    UnprocessableEntity = (422, "Unprocessable Entity");
    TooEarly = (425, "Too Early");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    /// Sent when a handler returns an error of its own
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

// MIME

pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for a file extension (without the dot, lower case).
///
/// Unknown extensions map to `application/octet-stream`.
pub fn mime_by_extension(ext: &str) -> &'static str {
    match ext {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gzip" | "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpeg" | "jpg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "weba" => "audio/webm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => OCTET_STREAM,
    }
}

/// Content type of a path, `text/*` types get `; charset=UTF-8`.
pub(crate) fn content_type_for(path: &std::path::Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let mime = mime_by_extension(&ext);
    match mime.starts_with("text") {
        true => format!("{mime}; charset=UTF-8"),
        false => mime.to_string(),
    }
}

/// Splits `value; key=val; key2="val2"` into the main value and its parameters.
pub(crate) fn parse_header_value(value: &str) -> (&str, Vec<(&str, &str)>) {
    let mut parts = value.split(';');
    let main = parts.next().unwrap_or("").trim();

    let params = parts
        .filter_map(|part| {
            let (key, val) = part.split_once('=')?;
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            Some((key.trim(), val))
        })
        .collect();

    (main, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn method_tokens() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Some(Method::Get)),
            ("POST",    Some(Method::Post)),
            ("PUT",     Some(Method::Put)),
            ("PATCH",   Some(Method::Patch)),
            ("DELETE",  Some(Method::Delete)),
            ("OPTIONS", Some(Method::Options)),
            ("HEAD",    Some(Method::Head)),

            ("get",     None),
            ("GETS",    None),
            ("",        None),
        ];

        for (token, expected) in cases {
            match expected {
                Some(method) => {
                    assert_eq!(Method::from_bytes(token.as_bytes()), Ok(method));
                    assert_eq!(method.as_str(), token);
                }
                None => assert_eq!(
                    Method::from_bytes(token.as_bytes()),
                    Err(ProtocolError::InvalidMethod.into())
                ),
            }
        }
    }

    #[test]
    fn status_lines() {
        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,             Version::Http11, "HTTP/1.1 200 OK\r\n"),
            (StatusCode::NotFound,       Version::Http10, "HTTP/1.0 404 Not Found\r\n"),
            (StatusCode::PartialContent, Version::Http11, "HTTP/1.1 206 Partial Content\r\n"),
        ];

        for (status, version, line) in cases {
            assert_eq!(status.into_first_line(version), line.as_bytes());
            assert_eq!(StatusCode::from_u16(status.as_u16()), Some(status));
            assert_eq!(status.as_code_str(), status.as_u16().to_string());
        }
        assert_eq!(StatusCode::from_u16(299), None);
    }

    #[test]
    fn mime_table() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",   "text/html; charset=UTF-8"),
            ("app.JS",       "text/javascript; charset=UTF-8"),
            ("logo.png",     "image/png"),
            ("archive.tar",  "application/x-tar"),
            ("noext",        "application/octet-stream"),
            ("data.unknown", "application/octet-stream"),
        ];

        for (path, expected) in cases {
            assert_eq!(content_type_for(Path::new(path)), expected);
        }
    }

    #[test]
    fn header_values() {
        let (main, params) =
            parse_header_value("multipart/form-data; boundary=\"abc def\"; charset=utf-8");

        assert_eq!(main, "multipart/form-data");
        assert_eq!(params, vec![("boundary", "abc def"), ("charset", "utf-8")]);

        let (main, params) = parse_header_value("  text/plain ");
        assert_eq!(main, "text/plain");
        assert!(params.is_empty());
    }

    #[test]
    fn numbers() {
        assert_eq!(slice_to_usize(b"0"), Some(0));
        assert_eq!(slice_to_usize(b"1350"), Some(1350));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"12a"), None);
        assert_eq!(slice_to_usize(b"999999999999999999999999"), None);

        assert_eq!(hex_value(b'f'), Some(15));
        assert_eq!(hex_value(b'A'), Some(10));
        assert_eq!(hex_value(b'g'), None);
    }
}
