//! Request head parsing and the handler-facing [`Request`].

use crate::{
    errors::{ErrorKind, ProtocolError},
    http::{
        cursor::{BodyStream, Parser, Source},
        form::{self, FileData, FormSink},
        query::Query,
        types::{self, Method, Version},
        uri::{self, Decomposed},
    },
    limits::ReqLimits,
    mask::Mask,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    cell::OnceCell,
    collections::HashMap,
    fs::File,
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Everything known about a request once its head is parsed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestData {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) uri: String,

    pub(crate) path: Vec<String>,
    pub(crate) divided: Option<usize>,

    /// Lower-cased names, the first occurrence wins
    pub(crate) headers: HashMap<String, String>,
    pub(crate) params: HashMap<String, String>,

    pub(crate) body_size: Option<usize>,
    pub(crate) has_body: bool,
    pub(crate) peer: Option<SocketAddr>,
}

impl RequestData {
    pub(crate) fn new(method: Method, version: Version, uri: String, target: Decomposed) -> Self {
        Self {
            method,
            version,
            uri,
            path: target.path,
            divided: target.divided,
            headers: HashMap::new(),
            params: HashMap::new(),
            body_size: None,
            has_body: false,
            peer: None,
        }
    }

    /// Number of path segments, the query segment excluded.
    #[inline]
    pub(crate) fn path_size(&self) -> usize {
        self.divided.unwrap_or(self.path.len())
    }

    #[inline]
    pub(crate) fn insert_header(&mut self, name: String, value: String) {
        self.headers.entry(name).or_insert(value);
    }

    /// Reads `content-length` into [`body_size`](Self::body_size).
    pub(crate) fn parse_content_length(&mut self) -> Result<(), ErrorKind> {
        self.body_size = match self.headers.get("content-length") {
            Some(value) => Some(
                types::slice_to_usize(value.trim().as_bytes())
                    .ok_or(ProtocolError::InvalidHeader)?,
            ),
            None => None,
        };
        Ok(())
    }

    pub(crate) fn keep_alive(&self) -> bool {
        let connection = self.headers.get("connection");
        match (self.version, connection) {
            (_, Some(value)) if value.eq_ignore_ascii_case("close") => false,
            (Version::Http10, Some(value)) => value.eq_ignore_ascii_case("keep-alive"),
            (Version::Http10, None) => false,
            _ => true,
        }
    }
}

#[inline]
fn strip_cr(token: &mut Vec<u8>) {
    if token.last() == Some(&b'\r') {
        token.pop();
    }
}

/// Parses a request line and header block from `parser`.
///
/// On success the parser window starts at the first body byte.
pub(crate) async fn read_head(
    parser: &mut Parser,
    src: &mut dyn Source,
    max: usize,
) -> Result<RequestData, ErrorKind> {
    parser.start_head();

    // Blank lines between pipelined requests
    while matches!(parser.peek(src).await?, b'\r' | b'\n') {
        parser.consume(1)?;
    }

    let mut token = Vec::with_capacity(64);
    parser.read_until(src, b" ", &mut token, max).await?;
    let method = Method::from_bytes(&token)?;

    token.clear();
    parser.read_until(src, b" ", &mut token, max).await?;
    let target = uri::decompose(&token)?;
    let uri = String::from_utf8(token.clone()).map_err(|_| ProtocolError::InvalidUri)?;

    token.clear();
    parser.read_until(src, b"\n", &mut token, max).await?;
    strip_cr(&mut token);
    let version = Version::from_bytes(&token)?;

    let mut data = RequestData::new(method, version, uri, target);

    loop {
        match parser.peek(src).await? {
            b'\r' => {
                parser.consume(1)?;
                if parser.peek(src).await? != b'\n' {
                    return Err(ProtocolError::InvalidHeader.into());
                }
                parser.consume(1)?;
                break;
            }
            b'\n' => {
                parser.consume(1)?;
                break;
            }
            _ => {}
        }

        token.clear();
        if parser.read_until(src, b":\n", &mut token, max).await? == b'\n' || token.is_empty() {
            return Err(ProtocolError::InvalidHeader.into());
        }
        types::to_lower_case(&mut token);
        let name = simdutf8::basic::from_utf8(&token)
            .map_err(|_| ProtocolError::InvalidHeader)?
            .to_string();

        while parser.peek(src).await? == b' ' {
            parser.consume(1)?;
        }

        token.clear();
        parser.read_until(src, b"\n", &mut token, max).await?;
        strip_cr(&mut token);
        let value = simdutf8::basic::from_utf8(&token)
            .map_err(|_| ProtocolError::InvalidHeader)?
            .to_string();

        data.insert_header(name, value);
    }

    data.parse_content_length()?;
    Ok(data)
}

/// What happens to file parts met by [`Request::form`].
enum FileMode<'c> {
    Skip,
    ToStr,
    ToLocal(PathBuf),
    Callback(Box<dyn FnMut(&FileData, Option<&[u8]>) -> Result<(), ErrorKind> + Send + 'c>),
}

/// An incoming request as seen by handlers, layers and error pages.
///
/// The body is not read until one of [`text`](Self::text),
/// [`json`](Self::json) or [`form`](Self::form) is called, and it can be
/// read only once. Whatever a handler leaves unread is drained before the
/// next request on the connection.
///
/// # Examples
/// ```no_run
/// use trellis_web::{Error, Handler, Request, Response};
///
/// struct Greet;
///
/// impl Handler for Greet {
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
///         let name = req.param("name")?.to_string();
///         let lang = req.query().get("lang").cloned().unwrap_or_default();
///
///         resp.text(format!("hello {name} ({lang})"))
///     }
/// }
/// ```
pub struct Request<'c> {
    data: RequestData,
    body: BodyStream<'c>,
    limits: &'c ReqLimits,
    mask: Option<Arc<Mask>>,

    query: OnceCell<HashMap<String, String>>,
    stopped: bool,
    pub(crate) error: Option<ErrorKind>,

    file_mode: FileMode<'c>,
    files: Vec<FileData>,
}

impl<'c> Request<'c> {
    pub(crate) fn new(
        data: RequestData,
        parser: &'c mut Parser,
        source: &'c mut dyn Source,
        limits: &'c ReqLimits,
        mask: Option<Arc<Mask>>,
    ) -> Self {
        let total = data.body_size.unwrap_or(0);

        Self {
            data,
            body: BodyStream::new(parser, source, total),
            limits,
            mask,
            query: OnceCell::new(),
            stopped: false,
            error: None,
            file_mode: FileMode::Skip,
            files: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> &RequestData {
        &self.data
    }

    #[inline]
    pub(crate) fn set_mask(&mut self, mask: Option<Arc<Mask>>) {
        self.mask = mask;
    }

    /// Streams file parts to `callback`: once per chunk with `Some(bytes)`,
    /// then once with `None` when the part ends.
    pub fn set_file<F>(&mut self, callback: F)
    where
        F: FnMut(&FileData, Option<&[u8]>) -> Result<(), ErrorKind> + Send + 'c,
    {
        self.file_mode = FileMode::Callback(Box::new(callback));
    }

    /// Skips the unread body so the connection can go on.
    #[inline]
    pub(crate) async fn drain(&mut self) -> Result<(), ErrorKind> {
        self.body.drain().await
    }

    /// Hands the request to an error page.
    #[inline]
    pub(crate) fn fail(&mut self, err: ErrorKind) {
        self.stopped = false;
        self.error = Some(err);
    }
}

// Public API
impl Request<'_> {
    #[inline]
    pub fn method(&self) -> Method {
        self.data.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.data.version
    }

    /// The raw request target, as sent by the client.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.data.uri
    }

    /// Decoded path segments without the query.
    #[inline]
    pub fn path(&self) -> &[String] {
        &self.data.path[..self.data.path_size()]
    }

    /// Header value by name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self.data.headers.get(name) {
            Some(value) => Some(value),
            None => self
                .data
                .headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str),
        }
    }

    #[inline]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.data.headers
    }

    /// A value captured by a `[name]` route segment.
    ///
    /// # Errors
    /// `ParamMissing` when the matched route has no such parameter.
    pub fn param(&self, name: &str) -> Result<&str, ErrorKind> {
        self.data
            .params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ErrorKind::ParamMissing(name.to_string()))
    }

    /// Query parameters, parsed on first use. The last duplicate wins.
    pub fn query(&self) -> &HashMap<String, String> {
        self.query.get_or_init(|| {
            let mut map = HashMap::new();
            if let Some(divided) = self.data.divided {
                for segment in &self.data.path[divided..] {
                    Query::parse_into(&mut map, segment);
                }
            }
            map
        })
    }

    /// `content-length` of the request, if sent.
    #[inline]
    pub fn body_size(&self) -> Option<usize> {
        self.data.body_size
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.data.peer
    }

    /// The failure being handled, inside an `+error` handler.
    #[inline]
    pub fn error(&self) -> Option<&ErrorKind> {
        self.error.as_ref()
    }

    /// Stops the chain: no later layer nor the route handler will run.
    #[inline]
    pub fn stop_propagation(&mut self) {
        self.stopped = true;
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Reads the whole body as UTF-8 text.
    ///
    /// # Errors
    /// `BodySoLong` above [`max_plain_body_size`](ReqLimits::max_plain_body_size).
    pub async fn text(&mut self) -> Result<String, ErrorKind> {
        let bytes = self.read_body(self.limits.max_plain_body_size).await?;
        String::from_utf8(bytes).map_err(|_| ErrorKind::BodyParse("body is not valid UTF-8".into()))
    }

    /// Reads the body as JSON and checks it against the route mask.
    ///
    /// # Errors
    /// `BodySoLong` above [`max_json_body_size`](ReqLimits::max_json_body_size),
    /// `BodyParse` on invalid JSON, `BodyMaskValidationFailed` on a mask
    /// mismatch.
    pub async fn json(&mut self) -> Result<Value, ErrorKind> {
        let bytes = self.read_body(self.limits.max_json_body_size).await?;
        let value: Value = serde_json::from_slice(&bytes)?;

        match &self.mask {
            Some(mask) if !mask.validate(&value) => Err(ErrorKind::BodyMaskValidationFailed),
            _ => Ok(value),
        }
    }

    /// Same as [`json`](Self::json), deserialized into `T`.
    pub async fn json_as<T: DeserializeOwned>(&mut self) -> Result<T, ErrorKind> {
        let value = self.json().await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Reads an urlencoded or multipart form and returns its simple fields.
    ///
    /// File parts go wherever [`set_file`](Self::set_file) and friends
    /// said; by default they are skipped. Their descriptions are kept in
    /// [`files`](Self::files).
    ///
    /// # Errors
    /// * `ContentTypeMissing` without a `content-type` header;
    /// * `BoundaryMissing` for multipart without a `boundary`;
    /// * `SimpleParamAfterFile` when a simple field follows a file part;
    /// * `BodyMaskValidationFailed` when the fields fail the route mask.
    pub async fn form(&mut self) -> Result<HashMap<String, String>, ErrorKind> {
        let content_type = self
            .header("content-type")
            .ok_or(ErrorKind::ContentTypeMissing)?
            .to_string();
        let (mime, params) = types::parse_header_value(&content_type);

        let mut collector = Collector {
            fields: HashMap::new(),
            mode: &mut self.file_mode,
            files: &mut self.files,
            text: Vec::new(),
            text_limit: self.limits.max_json_body_size,
            local: None,
        };
        let limit = self.limits.max_form_field_size;

        match mime.to_ascii_lowercase().as_str() {
            "application/x-www-form-urlencoded" => {
                form::read_urlencoded(&mut self.body, limit, &mut collector).await?
            }
            "multipart/form-data" => {
                let boundary = params
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case("boundary"))
                    .map(|(_, value)| *value)
                    .filter(|value| !value.is_empty())
                    .ok_or(ErrorKind::BoundaryMissing)?;

                form::read_multipart(&mut self.body, boundary, limit, &mut collector).await?
            }
            other => {
                return Err(ErrorKind::BodyParse(format!(
                    "`{other}` is not a form content type"
                )))
            }
        }

        let fields = collector.fields;
        match &self.mask {
            Some(mask) if !mask.validate_form(&fields) => Err(ErrorKind::BodyMaskValidationFailed),
            _ => Ok(fields),
        }
    }

    /// Puts file contents into the form fields under their parameter name.
    ///
    /// Each file is bounded by [`max_json_body_size`](ReqLimits::max_json_body_size).
    #[inline]
    pub fn set_file_to_str(&mut self) {
        self.file_mode = FileMode::ToStr;
    }

    /// Saves each file part as `dir/<file name>`.
    ///
    /// Only the last component of the client-sent name is used.
    #[inline]
    pub fn set_file_to_local<P: AsRef<Path>>(&mut self, dir: P) {
        self.file_mode = FileMode::ToLocal(dir.as_ref().to_path_buf());
    }

    /// File parts seen by the last [`form`](Self::form) call.
    #[inline]
    pub fn files(&self) -> &[FileData] {
        &self.files
    }

    async fn read_body(&mut self, max: usize) -> Result<Vec<u8>, ErrorKind> {
        if self.body.total() > max {
            return Err(ErrorKind::BodySoLong(max));
        }

        let mut out = Vec::with_capacity(self.body.remaining());
        while let Some(chunk) = self.body.chunk().await? {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}

struct Collector<'r, 'c> {
    fields: HashMap<String, String>,
    mode: &'r mut FileMode<'c>,
    files: &'r mut Vec<FileData>,

    text: Vec<u8>,
    text_limit: usize,
    local: Option<File>,
}

impl FormSink for Collector<'_, '_> {
    fn field(&mut self, name: String, value: String) -> Result<(), ErrorKind> {
        self.fields.insert(name, value);
        Ok(())
    }

    fn file_begin(&mut self, file: FileData) -> Result<(), ErrorKind> {
        if let FileMode::ToLocal(dir) = &*self.mode {
            let name = Path::new(&file.file_name)
                .file_name()
                .ok_or_else(|| ErrorKind::BodyParse(format!("bad file name `{}`", file.file_name)))?;

            self.local = Some(File::create(dir.join(name)).map_err(ErrorKind::file)?);
        }

        self.text.clear();
        self.files.push(file);
        Ok(())
    }

    fn file_chunk(&mut self, chunk: &[u8]) -> Result<(), ErrorKind> {
        match &mut *self.mode {
            FileMode::Skip => Ok(()),
            FileMode::ToStr => {
                if self.text.len() + chunk.len() > self.text_limit {
                    return Err(ErrorKind::BodySoLong(self.text_limit));
                }
                self.text.extend_from_slice(chunk);
                Ok(())
            }
            FileMode::ToLocal(_) => match &mut self.local {
                Some(file) => file.write_all(chunk).map_err(ErrorKind::file),
                None => Ok(()),
            },
            FileMode::Callback(callback) => match self.files.last() {
                Some(file) => callback(file, Some(chunk)),
                None => Ok(()),
            },
        }
    }

    fn file_end(&mut self) -> Result<(), ErrorKind> {
        match &mut *self.mode {
            FileMode::Skip => Ok(()),
            FileMode::ToStr => {
                let text = String::from_utf8(std::mem::take(&mut self.text))
                    .map_err(|_| ErrorKind::BodyParse("file part is not valid UTF-8".into()))?;

                if let Some(file) = self.files.last() {
                    self.fields.insert(file.param_name.clone(), text);
                }
                Ok(())
            }
            FileMode::ToLocal(_) => match self.local.take() {
                Some(mut file) => file.flush().map_err(ErrorKind::file),
                None => Ok(()),
            },
            FileMode::Callback(callback) => match self.files.last() {
                Some(file) => callback(file, None),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ChunkedSource;
    use serde_json::json;

    macro_rules! request {
        ($raw:expr, $limits:expr, $mask:expr => $req:ident) => {
            let mut src = ChunkedSource::new($raw, 7);
            let mut parser = Parser::new(16, 4096);
            let data = read_head(&mut parser, &mut src, 4096).await.unwrap();
            let mut $req = Request::new(data, &mut parser, &mut src, $limits, $mask);
        };
    }

    async fn head(raw: &[u8], size: usize) -> Result<RequestData, ErrorKind> {
        let mut src = ChunkedSource::new(raw, size);
        let mut parser = Parser::new(size, 256);
        read_head(&mut parser, &mut src, 256).await
    }

    #[tokio::test]
    async fn head_every_split() {
        let raw = b"\r\nPOST /api/v1/items?sort=asc HTTP/1.1\r\n\
            Host: example.com\r\n\
            CONTENT-Length:   5\r\n\
            X-Empty:\r\n\
            x-dup: first\r\n\
            X-Dup: second\r\n\
            \r\n\
            hello";

        for size in 1..=raw.len() {
            let data = head(raw, size).await.unwrap();

            assert_eq!(data.method, Method::Post);
            assert_eq!(data.version, Version::Http11);
            assert_eq!(data.uri, "/api/v1/items?sort=asc");
            assert_eq!(data.path, ["api", "v1", "items", "sort=asc"]);
            assert_eq!(data.divided, Some(3));
            assert_eq!(data.headers["host"], "example.com");
            assert_eq!(data.headers["x-empty"], "");
            assert_eq!(data.headers["x-dup"], "first");
            assert_eq!(data.body_size, Some(5), "size={size}");
        }
    }

    #[tokio::test]
    async fn bare_lf_lines() {
        let data = head(b"GET / HTTP/1.0\nA: b\n\n", 4).await.unwrap();

        assert_eq!(data.version, Version::Http10);
        assert_eq!(data.headers["a"], "b");
        assert!(!data.keep_alive());
    }

    #[tokio::test]
    async fn head_errors() {
        #[rustfmt::skip]
        let cases: [(&[u8], ProtocolError); 8] = [
            (b"FETCH / HTTP/1.1\r\n\r\n",            ProtocolError::InvalidMethod),
            (b"GET nope HTTP/1.1\r\n\r\n",           ProtocolError::InvalidUri),
            (b"GET / HTTP/2.0\r\n\r\n",              ProtocolError::InvalidVersion),
            (b"GET / HTTP/1.1\r\nbroken\r\n\r\n",    ProtocolError::InvalidHeader),
            (b"GET / HTTP/1.1\r\n: v\r\n\r\n",       ProtocolError::InvalidHeader),
            (b"GET / HTTP/1.1\r\nContent-Length: x1\r\n\r\n", ProtocolError::InvalidHeader),
            (b"GET / HTTP/1.1\r\nHost: a",           ProtocolError::ConnectionClosed),
            (b"",                                    ProtocolError::ConnectionClosed),
        ];

        for (raw, expected) in cases {
            assert_eq!(head(raw, 3).await, Err(expected.into()), "{raw:?}");
        }

        let long = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(300));
        assert_eq!(
            head(long.as_bytes(), 32).await,
            Err(ProtocolError::HeaderTooLarge.into())
        );
    }

    #[test]
    fn keep_alive_rules() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, None,               true),
            (Version::Http11, Some("close"),      false),
            (Version::Http11, Some("Keep-Alive"), true),
            (Version::Http10, None,               false),
            (Version::Http10, Some("keep-alive"), true),
            (Version::Http3,  None,               true),
        ];

        for (version, connection, expected) in cases {
            let mut data = RequestData::new(Method::Get, version, "/".into(), Decomposed::default());
            if let Some(value) = connection {
                data.insert_header("connection".into(), value.into());
            }
            assert_eq!(data.keep_alive(), expected, "{version:?} {connection:?}");
        }
    }

    #[tokio::test]
    async fn accessors() {
        let limits = ReqLimits::default();
        request!(b"GET /a/b?x=1&y=two&x=3 HTTP/1.1\r\nX-Token: abc\r\n\r\n", &limits, None => req);
        req.data.params.insert("id".into(), "42".into());

        assert_eq!(req.path(), ["a", "b"]);
        assert_eq!(req.header("x-token"), Some("abc"));
        assert_eq!(req.header("X-TOKEN"), Some("abc"));
        assert_eq!(req.header("missing"), None);
        assert_eq!(req.param("id"), Ok("42"));
        assert_eq!(req.param("nope"), Err(ErrorKind::ParamMissing("nope".into())));
        assert_eq!(req.query().len(), 2);
        assert_eq!(req.query()["x"], "3");
        assert_eq!(req.query()["y"], "two");
    }

    #[tokio::test]
    async fn query_keeps_encoded_delimiters() {
        let limits = ReqLimits::default();
        request!(b"GET /s%20x?q=a%26b&k%3D1=x%3Dy&to=/a?b HTTP/1.1\r\n\r\n", &limits, None => req);

        assert_eq!(req.path(), ["s x"]);
        assert_eq!(req.query().len(), 3);
        assert_eq!(req.query()["q"], "a&b");
        assert_eq!(req.query()["k=1"], "x=y");
        assert_eq!(req.query()["to"], "/a?b");
        assert_eq!(req.query().get("b"), None);
    }

    #[tokio::test]
    async fn text_limits() {
        let limits = ReqLimits {
            max_plain_body_size: 8,
            ..ReqLimits::default()
        };

        request!(b"POST / HTTP/1.1\r\nContent-Length: 8\r\n\r\n12345678", &limits, None => req);
        assert_eq!(req.text().await.unwrap(), "12345678");

        request!(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n123456789", &limits, None => req);
        assert_eq!(req.text().await, Err(ErrorKind::BodySoLong(8)));
    }

    #[tokio::test]
    async fn json_with_mask() {
        let limits = ReqLimits::default();
        let mask = Arc::new(Mask::from_template(&json!({"a": "{number}"})).unwrap());

        request!(b"POST / HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"a\":1}", &limits, Some(mask.clone()) => req);
        assert_eq!(req.json().await.unwrap(), json!({"a": 1}));

        request!(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n{\"a\":\"x\"}", &limits, Some(mask) => req);
        assert_eq!(req.json().await, Err(ErrorKind::BodyMaskValidationFailed));

        request!(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\n{a}", &limits, None => req);
        assert!(matches!(req.json().await, Err(ErrorKind::BodyParse(_))));
    }

    #[tokio::test]
    async fn urlencoded_form() {
        let limits = ReqLimits::default();
        request!(b"POST / HTTP/1.1\r\n\
            Content-Type: application/x-www-form-urlencoded\r\n\
            Content-Length: 24\r\n\r\n\
            name=John+Smith&age=%332", &limits, None => req);

        let form = req.form().await.unwrap();
        assert_eq!(form["name"], "John Smith");
        assert_eq!(form["age"], "32");

        request!(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\na=1", &limits, None => req);
        assert_eq!(req.form().await, Err(ErrorKind::ContentTypeMissing));

        request!(b"POST / HTTP/1.1\r\n\
            Content-Type: multipart/form-data\r\n\
            Content-Length: 3\r\n\r\na=1", &limits, None => req);
        assert_eq!(req.form().await, Err(ErrorKind::BoundaryMissing));
    }

    const MULTIPART: &[u8] = b"POST /up HTTP/1.1\r\n\
        Content-Type: multipart/form-data; boundary=\"b0\"\r\n\
        Content-Length: 142\r\n\r\n\
        --b0\r\n\
        Content-Disposition: form-data; name=\"t\"\r\n\r\n\
        hi\r\n\
        --b0\r\n\
        Content-Disposition: form-data; name=\"f\"; filename=\"../a.txt\"\r\n\r\n\
        file body\r\n\
        --b0--";

    #[tokio::test]
    async fn multipart_file_modes() {
        let limits = ReqLimits::default();

        request!(MULTIPART, &limits, None => req);
        req.set_file_to_str();
        let form = req.form().await.unwrap();
        assert_eq!(form["t"], "hi");
        assert_eq!(form["f"], "file body");
        assert_eq!(req.files()[0].file_name, "../a.txt");
        assert_eq!(req.files()[0].mime_type, "text/plain");

        let dir = tempfile::tempdir().unwrap();
        request!(MULTIPART, &limits, None => req);
        req.set_file_to_local(dir.path());
        let form = req.form().await.unwrap();
        assert!(!form.contains_key("f"));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"file body");

        let mut seen = Vec::new();
        let mut ends = 0;
        {
            request!(MULTIPART, &limits, None => req);
            req.set_file(|file, chunk| {
                assert_eq!(file.param_name, "f");
                match chunk {
                    Some(bytes) => seen.extend_from_slice(bytes),
                    None => ends += 1,
                }
                Ok(())
            });
            req.form().await.unwrap();
        }
        assert_eq!(seen, b"file body");
        assert_eq!(ends, 1);
    }
}
