use crate::{
    compress::{Compressor, Compressors, FileCache},
    errors::ErrorKind,
    http::types::Method,
    limits::{ConnLimits, QuicLimits, ReqLimits, RespLimits, ServerLimits, TlsConfig},
    mask::Mask,
    pool::{thread_pool::ThreadPool, timer::TimerPool},
    quic::{
        conn_io::QuicContext,
        poll::{bind_udp, engine_config, QuicListener},
    },
    router::{Route, Target, UriPart},
    server::{
        connection::TcpTask,
        dispatch::Site,
        handler::{ErasedHandler, Handler},
        send::Upstream,
        tls,
    },
};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

const DEFAULT_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8888);
const BACKLOG: i32 = 1024;

/// An HTTP server serving routes over HTTP/1.x, HTTPS and HTTP/3.
///
/// Created by [`ServerBuilder::build`], started by [`Server::launch`].
///
/// # Examples
///
/// ```no_run
/// use trellis_web::{Error, Handler, Request, Response, Server, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
///         let name = req.param("name")?;
///         resp.status(StatusCode::Ok).text(&format!("Hello {name}!"))?;
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listen("127.0.0.1:8080".parse().unwrap())
///         .get("/hello/[name]", Hello)
///         .build()
///         .unwrap()
///         .launch()
///         .await
///         .unwrap();
/// }
/// ```
pub struct Server {
    site: Arc<Site>,
    tcp: Vec<(SocketAddr, Option<TlsConfig>)>,
    quic: Vec<(SocketAddr, TlsConfig)>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    quic_limits: QuicLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            router: UriPart::default(),
            error: None,
            tcp: Vec::new(),
            quic: Vec::new(),
            compressors: Compressors::default(),
            upstream: None,

            server_limits: ServerLimits::default(),
            connection_limits: ConnLimits::default(),
            request_limits: ReqLimits::default(),
            response_limits: RespLimits::default(),
            quic_limits: QuicLimits::default(),
        }
    }

    /// Binds every listener and serves until the worker pool stops.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) for unreadable TLS material
    /// - [`Error::Io`](crate::Error::Io) when an address cannot be bound or
    ///   the worker threads cannot be spawned
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # trellis_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use trellis_web::Server;
    ///
    /// Server::builder()
    ///     .listen("127.0.0.1:8080".parse().unwrap())
    ///     .get("/", MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .unwrap()
    ///     .launch()
    ///     .await
    ///     .unwrap();
    /// # }
    /// ```
    pub async fn launch(self) -> Result<(), ErrorKind> {
        let limits = &self.server_limits;
        let pool = ThreadPool::new(limits.worker_threads, limits.queue_levels)?;
        let timers = TimerPool::new(pool.clone(), limits.timer_level, limits.timer_tick);

        let mut tasks = JoinSet::new();
        if let Err(err) = self.start(&pool, &timers, &mut tasks) {
            pool.stop();
            return Err(err);
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                debug!("listener task ended: {err}");
            }
        }

        pool.stop();
        Ok(())
    }

    fn start(
        &self,
        pool: &ThreadPool,
        timers: &TimerPool,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), ErrorKind> {
        let limits = &self.server_limits;

        for (addr, tls_config) in &self.tcp {
            let acceptor = tls_config.as_ref().map(tls::acceptor).transpose()?;
            let listener = TcpListener::from_std(bind_tcp(*addr)?)?;

            info!(
                "{} listening on {}",
                if acceptor.is_some() { "https" } else { "http" },
                listener.local_addr()?
            );
            tasks.spawn(accept_loop(
                listener,
                self.site.clone(),
                self.conn_limits.clone(),
                acceptor,
                pool.clone(),
                limits.tcp_level,
            ));
        }

        if self.quic.is_empty() {
            return Ok(());
        }

        if !timers.start() {
            return Err(ErrorKind::Engine("cannot start the timer task".into()));
        }

        for (addr, tls_config) in &self.quic {
            let config = engine_config(&self.quic_limits, tls_config)?;
            let socket = bind_udp(*addr)?;

            let ctx = Arc::new(QuicContext {
                table: DashMap::new(),
                socket: socket.try_clone()?,
                pool: pool.clone(),
                timers: timers.clone(),
                site: self.site.clone(),
                limits: self.quic_limits.clone(),
                level: limits.quic_level,
            });
            tasks.spawn(QuicListener::new(socket, config, ctx)?.run());
        }

        Ok(())
    }
}

fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener, ErrorKind> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Hands every accepted socket to the pool; workers own it from there.
async fn accept_loop(
    listener: TcpListener,
    site: Arc<Site>,
    limits: ConnLimits,
    tls: Option<TlsAcceptor>,
    pool: ThreadPool,
    level: usize,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!("accept failed: {err}");
                continue;
            }
        };

        // Leaves this runtime; the worker registers it with its own
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                debug!("cannot detach {peer}: {err}");
                continue;
            }
        };

        let task = TcpTask::new(stream, peer, site.clone(), limits.clone(), tls.clone());
        if !pool.append_task(Box::new(task), level) {
            break;
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// Registration errors (a duplicate route, a bad pattern) do not panic: the
/// first one is kept and returned by [`build`](Self::build).
///
/// # Protocol Support
///
/// - `HTTP/1.X`: enabled by [`listen`](Self::listen), and by default on
///   `0.0.0.0:8888` when no listener is configured
/// - `HTTPS`: enabled by [`listen_tls`](Self::listen_tls)
/// - `HTTP/3`: enabled by [`listen_quic`](Self::listen_quic)
pub struct ServerBuilder {
    router: UriPart,
    error: Option<ErrorKind>,
    tcp: Vec<(SocketAddr, Option<TlsConfig>)>,
    quic: Vec<(SocketAddr, TlsConfig)>,
    compressors: Compressors,
    upstream: Option<Arc<dyn Upstream>>,

    server_limits: ServerLimits,
    connection_limits: ConnLimits,
    request_limits: ReqLimits,
    response_limits: RespLimits,
    quic_limits: QuicLimits,
}

impl ServerBuilder {
    /// Adds a plain HTTP/1.x listener.
    #[inline(always)]
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.tcp.push((addr, None));
        self
    }

    /// Adds an HTTPS listener.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # trellis_web::impt_default_handler!{ MyStruct }
    /// use trellis_web::{Server, limits::{TlsConfig, TlsVersion}};
    ///
    /// let server = Server::builder()
    ///     .listen_tls(
    ///         "0.0.0.0:443".parse().unwrap(),
    ///         TlsConfig {
    ///             min_version: TlsVersion::Tls13,
    ///             ..TlsConfig::new("cert.pem", "key.pem")
    ///         },
    ///     )
    ///     .get("/", MyStruct)
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn listen_tls(mut self, addr: SocketAddr, tls: TlsConfig) -> Self {
        self.tcp.push((addr, Some(tls)));
        self
    }

    /// Adds an HTTP/3 listener on UDP.
    ///
    /// Only [`TlsConfig::cert`] and [`TlsConfig::key`] are used; QUIC always
    /// runs TLS 1.3.
    #[inline(always)]
    pub fn listen_quic(mut self, addr: SocketAddr, tls: TlsConfig) -> Self {
        self.quic.push((addr, tls));
        self
    }

    fn register(mut self, method: Method, pattern: &str, target: Target) -> Self {
        if self.error.is_none() {
            if let Err(err) = self.router.set_handler(method, pattern, target) {
                self.error = Some(err);
            }
        }
        self
    }

    #[inline]
    fn erase<H: Handler>(handler: H) -> Arc<dyn ErasedHandler> {
        Arc::new(handler)
    }

    /// Registers `handler` for `method` under `pattern`.
    ///
    /// A segment may hold `[name]` parameters, e.g. `/users/[id]` or
    /// `/files/[name].[ext]`. A final `+error` or `+layer` segment registers
    /// an error page or a layer for everything below its parent.
    #[inline]
    pub fn route<H: Handler>(self, method: Method, pattern: &str, handler: H) -> Self {
        let route = Route::new(pattern, Self::erase(handler));
        self.register(method, pattern, Target::Handler(route))
    }

    /// Like [`route`](Self::route), validating the JSON request body against
    /// `req_mask` before the handler runs and the JSON response against
    /// `resp_mask` after it.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # trellis_web::impt_default_handler!{ CreateUser }
    /// use trellis_web::{Mask, Method, Server};
    ///
    /// let user = Mask::object([("name", Mask::string()), ("age", Mask::number())])
    ///     .optional("age");
    ///
    /// let server = Server::builder()
    ///     .route_masked(Method::Post, "/users", CreateUser, Some(user), None)
    ///     .build();
    /// ```
    pub fn route_masked<H: Handler>(
        self,
        method: Method,
        pattern: &str,
        handler: H,
        req_mask: Option<Mask>,
        resp_mask: Option<Mask>,
    ) -> Self {
        let mut route = Route::new(pattern, Self::erase(handler));
        route.req_mask = req_mask.map(Arc::new);
        route.resp_mask = resp_mask.map(Arc::new);
        self.register(method, pattern, Target::Handler(route))
    }

    #[inline]
    pub fn get<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Get, pattern, handler)
    }

    #[inline]
    pub fn post<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Post, pattern, handler)
    }

    #[inline]
    pub fn put<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Put, pattern, handler)
    }

    #[inline]
    pub fn patch<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Patch, pattern, handler)
    }

    #[inline]
    pub fn delete<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Delete, pattern, handler)
    }

    #[inline]
    pub fn options<H: Handler>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::Options, pattern, handler)
    }

    /// Serves files of `dir` for `GET` requests below `prefix`.
    ///
    /// The segments after the prefix are joined to `dir`; `..` and empty
    /// segments are answered with `404`. Files get compression and partial
    /// content automatically.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trellis_web::Server;
    ///
    /// // GET /assets/css/site.css -> ./public/css/site.css
    /// let server = Server::builder()
    ///     .get_static("/assets", "./public")
    ///     .build();
    /// ```
    #[inline]
    pub fn get_static<P: Into<PathBuf>>(self, prefix: &str, dir: P) -> Self {
        self.register(Method::Get, prefix, Target::Static(dir.into()))
    }

    /// Registers the error page of `prefix`, shorthand for `prefix/+error`.
    ///
    /// It renders every failed or unmatched request below `prefix` unless a
    /// deeper error page exists. The failure is available through
    /// [`Request::error`](crate::Request::error).
    #[inline]
    pub fn error<H: Handler>(self, method: Method, prefix: &str, handler: H) -> Self {
        let pattern = special(prefix, "+error");
        self.route(method, &pattern, handler)
    }

    /// Registers a layer on `prefix`, shorthand for `prefix/+layer`.
    ///
    /// Layers run outermost first before the handler; one may end the
    /// request with [`Request::stop_propagation`](crate::Request::stop_propagation).
    #[inline]
    pub fn layer<H: Handler>(self, method: Method, prefix: &str, handler: H) -> Self {
        let pattern = special(prefix, "+layer");
        self.route(method, &pattern, handler)
    }

    /// Adds a content encoding, replacing a registered one with the same name.
    #[inline]
    pub fn compressor<C: Compressor>(mut self, compressor: C) -> Self {
        self.compressors.register(Arc::new(compressor));
        self
    }

    /// Sets the backend used by [`Response::proxy`](crate::Response::proxy).
    #[inline]
    pub fn upstream<U: Upstream>(mut self, upstream: U) -> Self {
        self.upstream = Some(Arc::new(upstream));
        self
    }

    /// Configures the worker pool and the error format.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # trellis_web::impt_default_handler!{ MyStruct }
    /// use trellis_web::{Server, limits::ServerLimits};
    ///
    /// let server = Server::builder()
    ///     .get("/", MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         worker_threads: 8,
    ///         json_errors: false,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = limits;
        self
    }

    /// Configures HTTP/1.x connection timeouts.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # trellis_web::impt_default_handler!{ MyStruct }
    /// use trellis_web::{Server, limits::ConnLimits};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .get("/", MyStruct) // structure with Handler implementation
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         keep_alive: Duration::from_secs(5),
    ///         connection_lifetime: Duration::from_secs(200),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = limits;
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = limits;
        self
    }

    /// Configures response streaming and the compressed file cache.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = limits;
        self
    }

    /// Configures the QUIC transport of HTTP/3 listeners.
    #[inline(always)]
    pub fn quic_limits(mut self, limits: QuicLimits) -> Self {
        self.quic_limits = limits;
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) for the first failed route
    /// registration, or when the scheduling levels do not fit the pool:
    /// - `worker_threads` is `0`
    /// - `tcp_level`, `quic_level` or `timer_level` is not below `queue_levels`
    pub fn build(self) -> Result<Server, ErrorKind> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let limits = &self.server_limits;
        if limits.worker_threads == 0 {
            return Err(ErrorKind::Config("`worker_threads` must be at least 1".into()));
        }
        let levels = [
            ("tcp_level", limits.tcp_level),
            ("quic_level", limits.quic_level),
            ("timer_level", limits.timer_level),
        ];
        for (name, level) in levels {
            if level >= limits.queue_levels {
                return Err(ErrorKind::Config(format!(
                    "`{name}` {level} is not below `queue_levels` {}",
                    limits.queue_levels
                )));
            }
        }

        let mut tcp = self.tcp;
        if tcp.is_empty() && self.quic.is_empty() {
            tcp.push((SocketAddr::from(DEFAULT_ADDR), None));
        }

        let site = Site {
            router: self.router,
            cache: FileCache::new(self.response_limits.cache_dir.clone()),
            req_limits: self.request_limits,
            resp_limits: self.response_limits,
            compressors: Arc::new(self.compressors),
            upstream: self.upstream,
            json_errors: self.server_limits.json_errors,
        };

        Ok(Server {
            site: Arc::new(site),
            tcp,
            quic: self.quic,
            server_limits: self.server_limits,
            conn_limits: self.connection_limits,
            quic_limits: self.quic_limits,
        })
    }
}

fn special(prefix: &str, page: &str) -> String {
    format!("{}/{page}", prefix.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, Response, StatusCode};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    struct Hello;

    impl Handler for Hello {
        async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), ErrorKind> {
            let name = req.param("name")?.to_string();
            resp.status(StatusCode::Ok).text(&format!("hello {name}"))?;
            Ok(())
        }
    }

    #[test]
    fn special_pages() {
        #[rustfmt::skip]
        let cases = [
            ("",        "+error", "/+error"),
            ("/",       "+error", "/+error"),
            ("/api",    "+layer", "/api/+layer"),
            ("/api/",   "+layer", "/api/+layer"),
        ];

        for (prefix, page, expected) in cases {
            assert_eq!(special(prefix, page), expected);
        }
    }

    #[test]
    fn build_errors() {
        let duplicate = Server::builder()
            .get("/a/[id]", Hello)
            .get("/a/[id]", Hello)
            .build();
        assert!(matches!(duplicate, Err(ErrorKind::Config(_))));

        let no_workers = Server::builder().server_limits(ServerLimits {
            worker_threads: 0,
            ..ServerLimits::default()
        });
        assert!(matches!(no_workers.build(), Err(ErrorKind::Config(_))));

        let bad_level = Server::builder().server_limits(ServerLimits {
            queue_levels: 2,
            quic_level: 2,
            ..ServerLimits::default()
        });
        assert!(matches!(bad_level.build(), Err(ErrorKind::Config(_))));

        let bad_timer = Server::builder().server_limits(ServerLimits {
            timer_level: 3,
            ..ServerLimits::default()
        });
        assert!(matches!(bad_timer.build(), Err(ErrorKind::Config(_))));

        // Timers on their own queue above the streams
        let split = Server::builder().get("/", Hello).server_limits(ServerLimits {
            queue_levels: 4,
            timer_level: 3,
            ..ServerLimits::default()
        });
        assert_eq!(split.build().unwrap().server_limits.timer_level, 3);

        let statics_on_error = Server::builder().get_static("/+error", "/tmp").build();
        assert!(matches!(statics_on_error, Err(ErrorKind::Config(_))));
    }

    #[test]
    fn default_listener() {
        let server = Server::builder().get("/", Hello).build().unwrap();
        assert_eq!(server.tcp.len(), 1);
        assert_eq!(server.tcp[0].0, "0.0.0.0:8888".parse::<SocketAddr>().unwrap());
        assert!(server.tcp[0].1.is_none());

        let quic_only = Server::builder()
            .listen_quic("127.0.0.1:0".parse().unwrap(), TlsConfig::new("c.pem", "k.pem"))
            .build()
            .unwrap();
        assert!(quic_only.tcp.is_empty());
    }

    #[tokio::test]
    async fn launch_fails_on_missing_tls() {
        let server = Server::builder()
            .listen_tls(
                "127.0.0.1:0".parse().unwrap(),
                TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem"),
            )
            .build()
            .unwrap();

        assert!(matches!(server.launch().await, Err(ErrorKind::Config(_))));
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let addr = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };

        let server = Server::builder()
            .listen(addr)
            .get("/hello/[name]", Hello)
            .server_limits(ServerLimits {
                worker_threads: 2,
                ..ServerLimits::default()
            })
            .build()
            .unwrap();
        let running = tokio::spawn(server.launch());

        let mut client = None;
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut client = client.expect("server never came up");

        client
            .write_all(b"GET /hello/world HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{raw}");
        assert!(raw.ends_with("\r\n\r\nhello world"), "{raw}");

        running.abort();
    }
}
