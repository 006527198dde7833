//! Turning a finished [`Response`] into bytes on a transport.
//!
//! [`prepare`] resolves the body (proxy fetch, compression, ranges,
//! replacers) into a [`Plan`] with its final headers. [`write_plan`] then
//! streams the plan through a [`ResponseSink`]: plain HTTP/1.x framing on
//! TCP, `quiche` streams on HTTP/3.

use crate::{
    compress::FileCache,
    errors::ErrorKind,
    http::{
        replacer::{self, Replacer},
        response::{Body, Response},
        types::{self, StatusCode, Version},
    },
    limits::RespLimits,
};
use std::{
    collections::HashMap,
    fs,
    future::Future,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

const TEXT_HTML: &str = "text/html; charset=UTF-8";

/// What an [`Upstream`] answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstreamed {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Fetches the content of [`Response::proxy`] bodies.
///
/// The server has no HTTP client of its own; register one with
/// [`ServerBuilder::upstream`](crate::ServerBuilder::upstream).
///
/// # Examples
/// ```
/// use trellis_web::{Error, StatusCode, Upstream, Upstreamed};
/// use std::{future::Future, pin::Pin};
///
/// struct Canned;
///
/// impl Upstream for Canned {
///     fn fetch<'a>(
///         &'a self,
///         url: &'a str,
///     ) -> Pin<Box<dyn Future<Output = Result<Upstreamed, Error>> + Send + 'a>> {
///         Box::pin(async move {
///             Ok(Upstreamed {
///                 status: StatusCode::Ok,
///                 headers: vec![("content-type".into(), "text/plain".into())],
///                 body: format!("fetched {url}").into_bytes(),
///             })
///         })
///     }
/// }
/// ```
pub trait Upstream: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Upstreamed, ErrorKind>> + Send + 'a>>;
}

#[derive(Debug, PartialEq)]
pub(crate) enum PlanBody {
    Empty,
    Bytes(Vec<u8>),
    File {
        path: PathBuf,
        start: u64,
        len: u64,
        replacers: Option<HashMap<String, String>>,
    },
}

/// A response ready for the wire.
#[derive(Debug, PartialEq)]
pub(crate) struct Plan {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: PlanBody,

    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) head_only: bool,
}

impl Plan {
    #[inline]
    fn has_body(&self) -> bool {
        !self.head_only && self.body != PlanBody::Empty
    }
}

/// What [`prepare`] needs besides the response.
pub(crate) struct SendContext<'a> {
    pub(crate) limits: &'a RespLimits,
    pub(crate) cache: &'a FileCache,
    pub(crate) upstream: Option<&'a dyn Upstream>,
}

fn set(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

fn has(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n == name)
}

fn internal(err: io::Error) -> ErrorKind {
    ErrorKind::with_status(StatusCode::InternalServerError, format!("compression: {err}"))
}

/// Resolves `resp` into a [`Plan`].
///
/// Nothing is written here, so every failure can still become an error page.
pub(crate) async fn prepare(resp: &mut Response, ctx: &SendContext<'_>) -> Result<Plan, ErrorKind> {
    if let Body::Proxy(url) = &resp.body {
        let upstream = ctx
            .upstream
            .ok_or_else(|| ErrorKind::Config("proxy body without a registered upstream".into()))?;
        let fetched = upstream.fetch(url).await?;

        resp.status = fetched.status;
        for (name, value) in fetched.headers {
            if !matches!(
                name.to_ascii_lowercase().as_str(),
                "content-length" | "connection" | "transfer-encoding" | "keep-alive" | "date"
            ) {
                resp.header(name, value);
            }
        }
        resp.body = Body::Text(fetched.body);
    }

    let mut headers = std::mem::take(&mut resp.headers);
    let mut status = resp.status;
    set(&mut headers, "date", httpdate::fmt_http_date(SystemTime::now()));

    let body = match std::mem::replace(&mut resp.body, Body::None) {
        Body::None | Body::Proxy(_) => {
            set(&mut headers, "content-length", "0".into());
            PlanBody::Empty
        }
        Body::Text(mut bytes) => {
            if let Some(map) = &resp.replacers {
                bytes = replacer::replace_all(map, &bytes);
            }
            if let Some(name) = resp.compress_algorithm() {
                if let Some(compressor) = resp.compressors().get(name) {
                    bytes = compressor.compress(&bytes).map_err(internal)?;
                    set(&mut headers, "content-encoding", name.into());
                    set(&mut headers, "vary", "accept-encoding".into());
                }
            }
            if !has(&headers, "content-type") {
                headers.push(("content-type".into(), TEXT_HTML.into()));
            }

            set(&mut headers, "content-length", bytes.len().to_string());
            PlanBody::Bytes(bytes)
        }
        Body::File(path) => {
            let meta = fs::metadata(&path).map_err(ErrorKind::file)?;
            if !meta.is_file() {
                return Err(ErrorKind::file(io::Error::new(
                    io::ErrorKind::NotFound,
                    "not a regular file",
                )));
            }
            let size = meta.len();
            let min = ctx.limits.partial_data_min_size;
            let partial = resp.partial_enabled() && size >= min;

            if !has(&headers, "content-type") {
                headers.push(("content-type".into(), types::content_type_for(&path)));
            }

            let mut source = path;
            let mut size = size;
            if let Some(name) = resp.compress_algorithm().filter(|_| !partial) {
                if let Some(compressor) = resp.compressors().get(name) {
                    source = ctx
                        .cache
                        .get_or_compress(&source, compressor.as_ref())
                        .map_err(internal)?;
                    size = fs::metadata(&source).map_err(ErrorKind::file)?.len();

                    set(&mut headers, "content-encoding", name.into());
                    set(&mut headers, "vary", "accept-encoding".into());
                }
            }

            if partial {
                let (start, back) = byte_range(&resp.ranges, size, min)?;

                status = StatusCode::PartialContent;
                set(&mut headers, "accept-ranges", "bytes".into());
                set(&mut headers, "content-range", format!("bytes {start}-{back}/{size}"));
                set(&mut headers, "content-length", (back - start + 1).to_string());

                PlanBody::File {
                    path: source,
                    start,
                    len: back - start + 1,
                    replacers: None,
                }
            } else {
                let replacers = resp.replacers.take();
                let len = match &replacers {
                    Some(map) => replaced_len(&source, map)?,
                    None => size,
                };
                set(&mut headers, "content-length", len.to_string());

                PlanBody::File {
                    path: source,
                    start: 0,
                    len: size,
                    replacers,
                }
            }
        }
    };

    Ok(Plan {
        status,
        headers,
        body,
        version: resp.version,
        keep_alive: resp.keep_alive,
        head_only: resp.head_only,
    })
}

/// Inclusive byte range served for a partial response.
///
/// Without a requested range the first `min` bytes are sent. An open end
/// runs to the end of the file, a missing start means `0`.
pub(crate) fn byte_range(ranges: &[(i64, i64)], size: u64, min: u64) -> Result<(u64, u64), ErrorKind> {
    let last = size.saturating_sub(1);
    let (mut start, mut back) = (0u64, min.saturating_sub(1));

    if let [(first, second)] = ranges {
        if *first >= 0 {
            start = *first as u64;
        }
        back = match *second >= 0 {
            true => *second as u64,
            false => last,
        };
    }

    let back = back.min(last);
    match size > 0 && start <= back {
        true => Ok((start, back)),
        false => Err(ErrorKind::with_status(
            StatusCode::RangeNotSatisfiable,
            format!("bytes {start}-{back} outside of {size}"),
        )),
    }
}

/// Size of `path` once `map` is applied.
fn replaced_len(path: &Path, map: &HashMap<String, String>) -> Result<u64, ErrorKind> {
    use std::io::Read;

    let mut file = fs::File::open(path).map_err(ErrorKind::file)?;
    let mut replacer = Replacer::new(map);
    let mut buf = vec![0; 16 * 1024];
    let mut out = Vec::new();
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).map_err(ErrorKind::file)?;
        if n == 0 {
            break;
        }
        replacer.feed(&buf[..n], &mut out);
        total += out.len() as u64;
        out.clear();
    }
    replacer.finish(&mut out);

    Ok(total + out.len() as u64)
}

/// Bare response for `err` when no error page took it.
pub(crate) fn bare_error(resp: &mut Response, err: &ErrorKind, json: bool) {
    resp.clear();
    resp.status(err.status());

    if json {
        resp.header("content-type", "application/json");
        let _ = resp.text(err.as_json());
    }
}

/// A transport a [`Plan`] is written to.
pub(crate) trait ResponseSink: Send {
    fn send_head(
        &mut self,
        plan: &Plan,
        has_body: bool,
    ) -> impl Future<Output = Result<(), ErrorKind>> + Send;

    fn send_body(&mut self, chunk: &[u8], fin: bool)
        -> impl Future<Output = Result<(), ErrorKind>> + Send;
}

/// Writes `plan` to `sink`, files in `block` sized chunks.
pub(crate) async fn write_plan<S: ResponseSink>(
    plan: Plan,
    sink: &mut S,
    block: usize,
) -> Result<(), ErrorKind> {
    let has_body = plan.has_body();

    let file = match (&plan.body, has_body) {
        (PlanBody::File { path, start, .. }, true) => {
            let mut file = File::open(path).await.map_err(ErrorKind::file)?;
            file.seek(SeekFrom::Start(*start)).await.map_err(ErrorKind::file)?;
            Some(file)
        }
        _ => None,
    };

    sink.send_head(&plan, has_body).await?;
    if !has_body {
        return Ok(());
    }

    match (plan.body, file) {
        (PlanBody::Bytes(bytes), _) => sink.send_body(&bytes, true).await,
        (PlanBody::File { len, replacers, .. }, Some(mut file)) => {
            let mut buf = vec![0; block.max(1)];
            let mut replacer = replacers.as_ref().map(Replacer::new);
            let mut out = Vec::new();
            let mut left = len;

            while left > 0 {
                let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                left -= n as u64;

                match replacer.as_mut() {
                    Some(replacer) => {
                        out.clear();
                        replacer.feed(&buf[..n], &mut out);
                        if left == 0 {
                            replacer.finish(&mut out);
                        }
                        sink.send_body(&out, left == 0).await?;
                    }
                    None => sink.send_body(&buf[..n], left == 0).await?,
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// HTTP/1.x framing over a byte stream.
pub(crate) struct TcpSink<'s, S> {
    stream: &'s mut S,
    write_timeout: Duration,
    buffer: Vec<u8>,
    inlined: bool,
}

impl<'s, S: AsyncWrite + Unpin + Send> TcpSink<'s, S> {
    #[inline]
    pub(crate) fn new(stream: &'s mut S, write_timeout: Duration) -> Self {
        Self {
            stream,
            write_timeout,
            buffer: Vec::with_capacity(256),
            inlined: false,
        }
    }
}

/// `write_all` bounded by `limit`.
pub(crate) async fn write_bytes<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), ErrorKind> {
    timeout(limit, stream.write_all(bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))??;
    Ok(())
}

impl<S: AsyncWrite + Unpin + Send> ResponseSink for TcpSink<'_, S> {
    async fn send_head(&mut self, plan: &Plan, has_body: bool) -> Result<(), ErrorKind> {
        let buffer = &mut self.buffer;
        buffer.clear();
        buffer.extend_from_slice(plan.status.into_first_line(plan.version));

        for (name, value) in &plan.headers {
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        match (plan.keep_alive, plan.version) {
            (false, _) => buffer.extend_from_slice(b"connection: close\r\n"),
            (true, Version::Http10) => buffer.extend_from_slice(b"connection: keep-alive\r\n"),
            _ => {}
        }
        buffer.extend_from_slice(b"\r\n");

        // Small text bodies share the head's write
        self.inlined = false;
        if let (true, PlanBody::Bytes(bytes)) = (has_body, &plan.body) {
            if bytes.len() <= 4096 {
                buffer.extend_from_slice(bytes);
                self.inlined = true;
            }
        }

        write_bytes(self.stream, &self.buffer, self.write_timeout).await
    }

    async fn send_body(&mut self, chunk: &[u8], _fin: bool) -> Result<(), ErrorKind> {
        if std::mem::take(&mut self.inlined) {
            return Ok(());
        }
        write_bytes(self.stream, chunk, self.write_timeout).await
    }
}
