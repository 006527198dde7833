//! The handler-facing response builder.
//!
//! A [`Response`] only records what should be sent. Nothing reaches the wire
//! until the handler returns; the send pipeline then checks the options for
//! conflicts, so a bad combination fails before any byte is written.

use crate::{
    compress::Compressors,
    errors::ErrorKind,
    http::{
        request::RequestData,
        types::{Method, StatusCode, Version},
    },
    limits::RespLimits,
    mask::Mask,
    BodyWriter, WriteBuffer,
};
use serde_json::Value;
use std::{borrow::Cow, collections::HashMap, path::PathBuf, rc::Rc, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Body {
    None,
    Text(Vec<u8>),
    File(PathBuf),
    Proxy(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Compress {
    Disabled,
    Negotiated,
    Forced(&'static str),
}

/// HTTP response builder.
///
/// Instances are created by the server and passed to
/// [`Handler::handle`](crate::Handler::handle). Exactly one body may be
/// set: [`text`](Self::text), [`json`](Self::json), [`file`](Self::file) or
/// [`proxy`](Self::proxy). A response without a body is sent with
/// `content-length: 0`.
///
/// # Options
///
/// | Option | Setter | Cannot be combined with |
/// |---|---|---|
/// | compression | [`set_compress_enabled`](Self::set_compress_enabled) | partial content, replacers |
/// | partial content | [`set_partial_enabled`](Self::set_partial_enabled) | compression, replacers |
/// | `{{key}}` replacers | [`set_replacers`](Self::set_replacers) | compression, partial content |
///
/// # Examples
/// ```
/// # trellis_web::run_test(|resp| {
/// use trellis_web::StatusCode;
///
/// resp.status(StatusCode::Ok)
///     .header("x-powered-by", "trellis")
///     .text("<h1>Hello World</h1>")
/// # .unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Body,

    compress: Compress,
    accept_encoding: Option<String>,
    compressors: Arc<Compressors>,

    pub(crate) ranges: Vec<(i64, i64)>,
    partial: bool,
    pub(crate) replacers: Option<HashMap<String, String>>,
    pub(crate) auto_file: bool,

    mask: Option<Arc<Mask>>,
    capacity: usize,

    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) head_only: bool,
}

impl Response {
    pub(crate) fn new(limits: &RespLimits, compressors: Arc<Compressors>) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            body: Body::None,

            compress: Compress::Disabled,
            accept_encoding: None,
            compressors,

            ranges: Vec::new(),
            partial: false,
            replacers: None,
            auto_file: false,

            mask: None,
            capacity: limits.default_capacity,

            version: Version::Http11,
            keep_alive: true,
            head_only: false,
        }
    }

    /// Takes what the response depends on from the request head.
    pub(crate) fn bind_request(&mut self, data: &RequestData) {
        self.version = data.version;
        self.keep_alive = data.keep_alive();
        self.head_only = data.method == Method::Head;
        self.accept_encoding = data.headers.get("accept-encoding").cloned();
        self.ranges = data
            .headers
            .get("range")
            .map(|value| parse_range(value))
            .unwrap_or_default();
    }

    #[inline]
    pub(crate) fn set_mask(&mut self, mask: Option<Arc<Mask>>) {
        self.mask = mask;
    }

    #[inline]
    pub(crate) fn compressors(&self) -> &Compressors {
        &self.compressors
    }

    /// Marks the body as a static file: big files go out as partial
    /// content, the others compressed.
    pub(crate) fn serve_static(&mut self, path: PathBuf) {
        self.body = Body::File(path);
        self.auto_file = true;
        self.partial = true;
        self.compress = Compress::Negotiated;
    }

    /// Resets the body and options, keeping what came from the request.
    pub(crate) fn clear(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.body = Body::None;
        self.compress = Compress::Disabled;
        self.partial = false;
        self.replacers = None;
        self.auto_file = false;
    }

    #[inline]
    pub(crate) fn partial_enabled(&self) -> bool {
        self.partial
    }

    fn set_body(&mut self, body: Body) -> Result<(), ErrorKind> {
        match self.body {
            Body::None => {
                self.body = body;
                Ok(())
            }
            _ => Err(ErrorKind::ResponseConflict("the response body is already set")),
        }
    }
}

/// `bytes=start-end` into `(start, end)`, `-1` for a missing side.
///
/// Anything else, multi-range included, yields no range.
pub(crate) fn parse_range(value: &str) -> Vec<(i64, i64)> {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Vec::new();
    };
    if spec.contains(',') {
        return Vec::new();
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Vec::new();
    };

    let side = |s: &str| -> Option<i64> {
        match s.trim() {
            "" => Some(-1),
            s => s.parse::<i64>().ok().filter(|n| *n >= 0),
        }
    };

    match (side(start), side(end)) {
        (Some(-1), Some(-1)) | (None, _) | (_, None) => Vec::new(),
        (Some(start), Some(end)) => vec![(start, end)],
    }
}

// Public API
impl Response {
    /// Sets the status code (default: `200 OK`).
    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Sets a header, replacing an earlier one with the same name.
    ///
    /// Names are lower-cased. `content-length`, `connection` and `date` are
    /// managed by the server and ignored here; use [`close`](Self::close)
    /// to end the connection.
    ///
    /// # Examples
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// resp.header("x-request-id", 42)
    ///     .header("cache-control", "no-store");
    ///
    /// assert_eq!(resp.get_header("X-Request-Id"), Some("42"));
    /// # });
    /// ```
    pub fn header<N: AsRef<str>, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        let mut buffer = Vec::new();
        value.write_to(&mut buffer);
        self.put_header(name.as_ref(), buffer)
    }

    /// Sets a header built from several values joined by `split`.
    ///
    /// # Examples
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// resp.header_multi("x-ids", ", ", [123, 234, 345]);
    /// assert_eq!(resp.get_header("x-ids"), Some("123, 234, 345"));
    /// # });
    /// ```
    pub fn header_multi<N, S, I, V>(&mut self, name: N, split: S, values: I) -> &mut Self
    where
        N: AsRef<str>,
        S: WriteBuffer,
        I: IntoIterator<Item = V>,
        V: WriteBuffer,
    {
        let mut buffer = Vec::new();

        let mut iter = values.into_iter();
        if let Some(first) = iter.next() {
            first.write_to(&mut buffer);

            for value in iter {
                split.write_to(&mut buffer);
                value.write_to(&mut buffer);
            }
        }

        self.put_header(name.as_ref(), buffer)
    }

    /// Sets a header of `key=value` parameters joined by `split`.
    ///
    /// # Examples
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// resp.header_params("cache-control", ", ", [
    ///     ("max-age", Some("3600")),
    ///     ("must-revalidate", None),
    /// ]);
    /// assert_eq!(resp.get_header("cache-control"), Some("max-age=3600, must-revalidate"));
    /// # });
    /// ```
    pub fn header_params<N, S, I, K, V>(&mut self, name: N, split: S, params: I) -> &mut Self
    where
        N: AsRef<str>,
        S: WriteBuffer,
        I: IntoIterator<Item = (K, Option<V>)>,
        K: WriteBuffer,
        V: WriteBuffer,
    {
        let mut buffer = Vec::new();

        for (i, (key, value)) in params.into_iter().enumerate() {
            if i > 0 {
                split.write_to(&mut buffer);
            }
            key.write_to(&mut buffer);
            if let Some(value) = value {
                buffer.push(b'=');
                value.write_to(&mut buffer);
            }
        }

        self.put_header(name.as_ref(), buffer)
    }

    fn put_header(&mut self, name: &str, value: Vec<u8>) -> &mut Self {
        let name = name.trim().to_ascii_lowercase();
        if matches!(name.as_str(), "content-length" | "connection" | "date" | "") {
            return self;
        }

        let value = String::from_utf8_lossy(&value).replace(['\r', '\n'], " ");
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    /// A header set on this response, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Sets a buffered body. Without a `content-type` header it is sent as
    /// `text/html; charset=UTF-8`.
    ///
    /// # Errors
    /// `ResponseConflict` if a body is already set.
    pub fn text<T: WriteBuffer>(&mut self, value: T) -> Result<(), ErrorKind> {
        let mut buffer = Vec::with_capacity(self.capacity);
        value.write_to(&mut buffer);
        self.set_body(Body::Text(buffer))
    }

    /// Builds a buffered body piece by piece.
    ///
    /// # Examples
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// use std::io::Write;
    ///
    /// resp.text_with(|w| {
    ///     w.write("<ul>");
    ///     for i in 1..=3 {
    ///         write!(w, "<li>{i}</li>").unwrap();
    ///     }
    ///     w.write("</ul>");
    /// })
    /// # .unwrap();
    /// # });
    /// ```
    pub fn text_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> Result<(), ErrorKind> {
        let mut buffer = Vec::with_capacity(self.capacity);
        f(&mut BodyWriter(&mut buffer));
        self.set_body(Body::Text(buffer))
    }

    /// Sets a JSON body, checked against the route's response mask.
    ///
    /// # Errors
    /// `ResponseConflict` if a body is already set, `500` when the value
    /// does not match the response mask.
    pub fn json(&mut self, value: &Value) -> Result<(), ErrorKind> {
        if let Some(mask) = &self.mask {
            if !mask.validate(value) {
                return Err(ErrorKind::with_status(
                    StatusCode::InternalServerError,
                    "the response does not match the route mask",
                ));
            }
        }

        self.set_body(Body::Text(serde_json::to_vec(value)?))?;
        if self.get_header("content-type").is_none() {
            self.header("content-type", "application/json");
        }
        Ok(())
    }

    /// Streams the file at `path`. Its content type comes from the extension.
    pub fn file<P: Into<PathBuf>>(&mut self, path: P) -> Result<(), ErrorKind> {
        self.set_body(Body::File(path.into()))
    }

    /// Sends what the registered [`Upstream`](crate::Upstream) returns for `url`.
    pub fn proxy<U: Into<String>>(&mut self, url: U) -> Result<(), ErrorKind> {
        self.set_body(Body::Proxy(url.into()))
    }

    /// Enables compression negotiated against `Accept-Encoding`.
    pub fn set_compress_enabled(&mut self, enabled: bool) -> Result<(), ErrorKind> {
        if !enabled {
            self.compress = Compress::Disabled;
            return Ok(());
        }
        self.check_compress()?;

        self.compress = Compress::Negotiated;
        Ok(())
    }

    /// Forces one registered coding, whatever the client accepts.
    ///
    /// # Errors
    /// `Config` for a coding with no registered compressor.
    pub fn set_compress_algorithm(&mut self, name: &str) -> Result<(), ErrorKind> {
        self.check_compress()?;

        let name = self
            .compressors
            .get(name)
            .map(|c| c.name())
            .ok_or_else(|| ErrorKind::Config(format!("no compressor named `{name}`")))?;

        self.compress = Compress::Forced(name);
        Ok(())
    }

    /// Coding the body will be sent with, if any.
    pub fn compress_algorithm(&self) -> Option<&'static str> {
        match self.compress {
            Compress::Disabled => None,
            Compress::Forced(name) => Some(name),
            Compress::Negotiated => self
                .accept_encoding
                .as_deref()
                .and_then(|header| self.compressors.negotiate(header)),
        }
    }

    /// Serves file bodies of at least
    /// [`partial_data_min_size`](RespLimits::partial_data_min_size) bytes
    /// as `206 Partial Content`.
    pub fn set_partial_enabled(&mut self, enabled: bool) -> Result<(), ErrorKind> {
        if enabled {
            if self.compress != Compress::Disabled {
                return Err(ErrorKind::ResponseConflict(
                    "partial content cannot be compressed",
                ));
            }
            if self.replacers.is_some() {
                return Err(ErrorKind::ResponseConflict(
                    "replacers cannot be used with partial content",
                ));
            }
        }

        self.partial = enabled;
        Ok(())
    }

    /// Substitutes `{{key}}` placeholders in the body while it is sent.
    pub fn set_replacers(&mut self, replacers: HashMap<String, String>) -> Result<(), ErrorKind> {
        if self.compress != Compress::Disabled {
            return Err(ErrorKind::ResponseConflict(
                "replacers cannot be used with compression",
            ));
        }
        if self.partial {
            return Err(ErrorKind::ResponseConflict(
                "replacers cannot be used with partial content",
            ));
        }

        self.replacers = Some(replacers);
        Ok(())
    }

    /// Closes the connection after this response.
    #[inline]
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    fn check_compress(&self) -> Result<(), ErrorKind> {
        if self.partial {
            return Err(ErrorKind::ResponseConflict(
                "partial content cannot be compressed",
            ));
        }
        if self.replacers.is_some() {
            return Err(ErrorKind::ResponseConflict(
                "replacers cannot be used with compression",
            ));
        }
        Ok(())
    }
}

pub mod write {
    use super::*;

    /// Writer for a buffered response body.
    /// Used in [text_with](Response::text_with).
    ///
    /// # Examples
    ///
    /// With [WriteBuffer]:
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// resp.text_with(|w| {
    ///     w.write("This goes in the response body");
    ///     w.write(123);
    ///     w.write(true);
    /// })
    /// # .unwrap();
    /// # });
    /// ```
    /// With [std::io::Write]:
    /// ```
    /// # trellis_web::run_test(|resp| {
    /// use std::io::Write;
    ///
    /// resp.text_with(|w| {
    ///     write!(w, "{} - {} = {}", 6, 2, 4).unwrap();
    /// })
    /// # .unwrap();
    /// # });
    /// ```
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Values that can be written into a header or a body.
    ///
    /// Implemented for strings, bytes, booleans, chars and integer types.
    /// Floats are left out to keep their formatting explicit.
    ///
    /// # Example
    /// ```
    /// use trellis_web::WriteBuffer;
    ///
    /// struct Celsius(i32);
    ///
    /// impl WriteBuffer for Celsius {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         self.0.write_to(buffer);
    ///         buffer.extend_from_slice("°C".as_bytes());
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_unsigned => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline]
    const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }

    #[inline(always)]
    pub(crate) fn write_unsigned(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        write_unsigned(value.unsigned_abs(), buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::uri::Decomposed;
    use serde_json::json;

    fn response(headers: &[(&str, &str)]) -> Response {
        let mut data = RequestData::new(Method::Get, Version::Http11, "/".into(), Decomposed::default());
        for (name, value) in headers {
            data.insert_header(name.to_string(), value.to_string());
        }

        let mut resp = Response::new(&RespLimits::default(), Arc::new(Compressors::default()));
        resp.bind_request(&data);
        resp
    }

    macro_rules! test_header {
        ($method:ident, $(($name:expr $(, $params:expr)*; $result:expr);)*) => {
            #[test] fn $method() {$(
                let mut resp = response(&[]);
                resp.$method($name $(, $params)*);
                assert_eq!(resp.get_header($name), Some($result));
            )*}
        };
    }

    test_header! {header,
        ("name", "value"; "value");
        ("name", ""; "");
        ("name", 123; "123");
        ("name", vec![35, 33, 43]; "#!+");
        ("name", false; "false");
        ("name", -123; "-123");
        ("name", u128::MAX; "340282366920938463463374607431768211455");
        ("name", i128::MIN; "-170141183460469231731687303715884105728");
        ("name", 'ü'; "ü");
        ("name", "a\r\nb"; "a  b");
    }

    test_header! {header_multi,
        ("name", ", ", ["q", "w", "e"]; "q, w, e");
        ("name", ",", [true, false]; "true,false");
        ("name", "; ", [-123, 123]; "-123; 123");
    }

    test_header! {header_params,
        ("name", ", ", [("q", Some("1")), ("w", Some("2"))]; "q=1, w=2");
        ("name", "; ", [("debug", None), ("text", Some("asd"))]; "debug; text=asd");
    }

    #[test]
    fn header_names() {
        let mut resp = response(&[]);
        resp.header("X-Id", 1)
            .header("x-id", 2)
            .header("Content-Length", 99)
            .header("Connection", "upgrade");

        assert_eq!(resp.headers, [("x-id".to_string(), "2".to_string())]);
    }

    #[test]
    fn single_body() {
        let mut resp = response(&[]);
        resp.text("a").unwrap();

        assert_eq!(resp.body, Body::Text(b"a".to_vec()));
        for second in [resp.text("b"), resp.file("/x"), resp.proxy("http://up"), resp.json(&json!(1))] {
            assert_eq!(second, Err(ErrorKind::ResponseConflict("the response body is already set")));
        }
    }

    #[test]
    fn json_body_and_mask() {
        let mut resp = response(&[]);
        resp.json(&json!({"ok": true})).unwrap();
        assert_eq!(resp.body, Body::Text(br#"{"ok":true}"#.to_vec()));
        assert_eq!(resp.get_header("content-type"), Some("application/json"));

        let mut resp = response(&[]);
        resp.set_mask(Some(Arc::new(Mask::from_template(&json!({"id": "{number}"})).unwrap())));
        assert_eq!(resp.json(&json!({"id": "x"})).unwrap_err().status(), StatusCode::InternalServerError);
        assert!(resp.json(&json!({"id": 7})).is_ok());
    }

    #[test]
    fn option_conflicts() {
        let mut resp = response(&[]);
        resp.set_compress_enabled(true).unwrap();
        assert!(resp.set_partial_enabled(true).is_err());
        assert!(resp.set_replacers(HashMap::new()).is_err());

        let mut resp = response(&[]);
        resp.set_partial_enabled(true).unwrap();
        assert!(resp.set_compress_enabled(true).is_err());
        assert!(resp.set_compress_algorithm("gzip").is_err());
        assert!(resp.set_replacers(HashMap::new()).is_err());

        let mut resp = response(&[]);
        resp.set_replacers(HashMap::new()).unwrap();
        assert!(resp.set_compress_enabled(true).is_err());
        assert!(resp.set_partial_enabled(true).is_err());

        // Turning an option off never conflicts
        assert!(resp.set_compress_enabled(false).is_ok());
        assert!(resp.set_partial_enabled(false).is_ok());
    }

    #[test]
    fn compression_choice() {
        #[rustfmt::skip]
        let cases = [
            (None,                     None,         None),
            (Some("gzip, br"),         None,         Some("gzip")),
            (Some("br;q=0.9, gzip"),   None,         Some("br")),
            (Some("zstd"),             None,         None),
            (Some("zstd"),             Some("br"),   Some("br")),
            (None,                     Some("GZIP"), Some("gzip")),
        ];

        for (accept, forced, expected) in cases {
            let headers: Vec<(&str, &str)> = accept.map(|a| ("accept-encoding", a)).into_iter().collect();
            let mut resp = response(&headers);
            assert_eq!(resp.compress_algorithm(), None);

            match forced {
                Some(name) => resp.set_compress_algorithm(name).unwrap(),
                None => resp.set_compress_enabled(true).unwrap(),
            }
            assert_eq!(resp.compress_algorithm(), expected, "{accept:?} {forced:?}");
        }

        let mut resp = response(&[]);
        assert!(matches!(resp.set_compress_algorithm("zstd"), Err(ErrorKind::Config(_))));
    }

    #[test]
    fn range_header() {
        #[rustfmt::skip]
        let cases: [(&str, &[(i64, i64)]); 9] = [
            ("bytes=0-99",      &[(0, 99)]),
            ("bytes=100-",      &[(100, -1)]),
            ("bytes=-500",      &[(-1, 500)]),
            ("bytes= 5 - 9 ",   &[(5, 9)]),
            ("bytes=-",         &[]),
            ("bytes=0-1,5-6",   &[]),
            ("bytes=a-b",       &[]),
            ("items=0-1",       &[]),
            ("bytes=10",        &[]),
        ];

        for (header, expected) in cases {
            assert_eq!(parse_range(header), expected, "{header}");
            assert_eq!(response(&[("range", header)]).ranges, expected, "{header}");
        }
    }

    #[test]
    fn head_and_connection() {
        let mut data = RequestData::new(Method::Head, Version::Http10, "/".into(), Decomposed::default());
        data.insert_header("connection".into(), "keep-alive".into());

        let mut resp = Response::new(&RespLimits::default(), Arc::new(Compressors::default()));
        resp.bind_request(&data);
        assert!(resp.head_only);
        assert!(resp.keep_alive);

        resp.close();
        assert!(!resp.keep_alive);
    }
}
