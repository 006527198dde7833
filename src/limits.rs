//! Server configuration limits and timeouts
//!
//! Every knob is a plain struct with a [`Default`] implementation, passed to
//! the [`ServerBuilder`](crate::ServerBuilder). Nothing is read from files or
//! the environment.
//!
//! # Memory Consumption
//!
//! Each worker owns at most one TCP connection at a time, so the steady
//! state is roughly:
//!
//! `Total` = `worker_threads` × ([`socket_block_size`](ReqLimits::socket_block_size) +
//!           [`default_capacity`](RespLimits::default_capacity)) +
//!           live QUIC connections × their buffered request bodies
//!
//! # Examples
//!
//! ```no_run
//! # trellis_web::impt_default_handler!{MyHandler}
//! use trellis_web::{Server, Method, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listen("127.0.0.1:8080".parse().unwrap())
//!         .route(Method::Get, "/", MyHandler)
//!         .server_limits(ServerLimits {
//!             worker_threads: 64, // More concurrent connections
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_plain_body_size: 16 * 1024, // 16KB text bodies
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```

use std::{path::PathBuf, time::Duration};

/// Controls the worker pool and the error response format.
///
/// # Scheduling
/// ```text
///  [ TCP accept ]        [ UDP receive ]
///        ||                     ||
///        || tcp_level           || quic_level (one task per finished stream)
///        ||                     || timer_level (fired idle and loss timers)
///        \/                     \/
///  [ queue 0 ] [ queue 1 ] [ queue 2 ] ...   <- highest index polled first
///        \\          ||          //
///         [ worker_threads std threads ]
/// ```
///
/// A task pushed at a level `>= queue_levels` bypasses the pool and runs on a
/// dedicated thread of its own.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker threads (default: `20`).
    ///
    /// Each worker owns a current-thread Tokio runtime and serves one task
    /// at a time: a whole TCP connection, or one QUIC stream.
    pub worker_threads: usize,

    /// Number of priority queues (default: `3`).
    pub queue_levels: usize,

    /// Queue used for accepted TCP connections (default: `0`).
    pub tcp_level: usize,

    /// Queue used for finished HTTP/3 streams (default: `2`).
    ///
    /// A stream task that runs out of stream capacity keeps its worker
    /// parked for up to [`max_idle_timeout`](QuicLimits::max_idle_timeout).
    pub quic_level: usize,

    /// Queue used for fired QUIC timers: loss recovery and idle expiry
    /// (default: `2`).
    ///
    /// With the default it shares the queue of HTTP/3 streams, so when every
    /// worker is parked on a blocked stream, timers wait for one of them to
    /// give up. Raise `queue_levels` and put timers above `quic_level` to
    /// serve them first:
    ///
    /// ```
    /// use trellis_web::limits::ServerLimits;
    ///
    /// let limits = ServerLimits {
    ///     queue_levels: 4,
    ///     timer_level: 3,
    ///     ..ServerLimits::default()
    /// };
    /// # assert!(limits.timer_level > limits.quic_level);
    /// ```
    pub timer_level: usize,

    /// Sleep between two passes of the timer task (default: `50ms`).
    ///
    /// It bounds the precision of QUIC idle timers.
    pub timer_tick: Duration,

    /// Format of the bare error responses (default: `true`)
    ///
    /// Bare responses are sent when a request fails and no `+error` page
    /// covers the route.
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 413 Payload Too Large\r
    /// content-length: 58\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Request body too large","code":"BODY_SO_LONG"}
    /// ```
    /// If `false`, the body is empty.
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            worker_threads: 20,
            queue_levels: 3,
            tcp_level: 0,
            quic_level: 2,
            timer_level: 2,
            timer_tick: Duration::from_millis(50),
            json_errors: true,

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts for HTTP/1.x
///
/// Default values balance performance, resource usage, and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum idle time while waiting for bytes from the socket (default: `2 seconds`)
    ///
    /// Every read races this timer, including reads in the middle of a
    /// request. When it fires the connection is closed without a response.
    pub keep_alive: Duration,

    /// Maximum duration to wait for writing data to socket (default: `3 seconds`)
    ///
    /// Applies to individual write operations.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// The last response sent after this deadline carries `connection: close`.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits
///
/// # Buffer
///
/// Requests are read through a single fixed buffer of
/// [`socket_block_size`](Self::socket_block_size) bytes. Tokens longer than
/// the buffer are carried across refills, so the buffer size only bounds a
/// single read, while [`max_header_block_size`](Self::max_header_block_size)
/// bounds the whole head.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus all header lines (default: `4096 B`)
    ///
    /// Exceeding it drops the connection with `HeaderTooLarge`.
    pub max_header_block_size: usize,

    /// Size of the receive buffer (default: `1350 B`)
    pub socket_block_size: usize,

    /// Limit for [`Request::text`](crate::Request::text) (default: `4 KB`)
    pub max_plain_body_size: usize,

    /// Limit for [`Request::json`](crate::Request::json) (default: `1 MB`)
    pub max_json_body_size: usize,

    /// Limit for a single simple field of [`Request::form`](crate::Request::form)
    /// (default: `64 KB`)
    pub max_form_field_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_header_block_size: 4096,
            socket_block_size: 1350,

            max_plain_body_size: 4 * 1024,
            max_json_body_size: 1024 * 1024,
            max_form_field_size: 64 * 1024,

            _priv: (),
        }
    }
}

/// Response streaming and caching limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Size of one chunk when streaming files (default: `1350 B`)
    pub socket_block_size: usize,

    /// Smallest file served as partial content (default: `4 MB`)
    ///
    /// When partial content is enabled and the file is at least this large,
    /// the response is `206` and, without a `Range` header, covers the
    /// first `partial_data_min_size` bytes.
    pub partial_data_min_size: u64,

    /// Initial capacity of the text body buffer (default: `1024 B`)
    pub default_capacity: usize,

    /// Directory holding compressed copies of served files
    /// (default: `<tmp>/trellis_web`)
    pub cache_dir: PathBuf,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            socket_block_size: 1350,
            partial_data_min_size: 4_194_304,
            default_capacity: 1024,
            cache_dir: std::env::temp_dir().join("trellis_web"),

            _priv: (),
        }
    }
}

/// Congestion control algorithm handed to the QUIC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    /// Keep the engine default
    #[default]
    Default,
    Reno,
    Cubic,
    Bbr,
    Bbr2,
}

impl CongestionControl {
    #[inline]
    pub(crate) const fn engine_name(self) -> Option<&'static str> {
        match self {
            CongestionControl::Default => None,
            CongestionControl::Reno => Some("reno"),
            CongestionControl::Cubic => Some("cubic"),
            CongestionControl::Bbr => Some("bbr"),
            CongestionControl::Bbr2 => Some("bbr2"),
        }
    }
}

/// QUIC transport parameters and HTTP/3 write behaviour.
#[derive(Debug, Clone)]
pub struct QuicLimits {
    /// Idle timeout advertised to the peer (default: `2 seconds`)
    ///
    /// Writers blocked on stream capacity give up after the same delay.
    pub max_idle_timeout: Duration,

    /// Connection flow-control window (default: `10_000_000`)
    pub initial_max_data: u64,
    /// Default: `1_000_000`
    pub initial_max_stream_data_bidi_local: u64,
    /// Default: `1_000_000`
    pub initial_max_stream_data_bidi_remote: u64,
    /// Default: `1_000_000`
    pub initial_max_stream_data_uni: u64,
    /// Default: `100`
    pub initial_max_streams_bidi: u64,
    /// Default: `100`
    pub initial_max_streams_uni: u64,

    /// Default: [`CongestionControl::Default`]
    pub cc_algorithm: CongestionControl,

    /// Log every packet at `debug` level (default: `false`)
    pub debug: bool,

    /// Stream capacity below which a writer parks until the receive loop
    /// reports the stream writable again (default: `5`)
    pub capacity_min: usize,

    /// Largest UDP payload sent or accepted (default: `1350`)
    pub max_datagram_size: usize,

    /// Request body bytes buffered per HTTP/3 stream before the stream is
    /// reset (default: `16 MB`)
    pub max_stream_body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for QuicLimits {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_millis(2000),
            initial_max_data: 10_000_000,
            initial_max_stream_data_bidi_local: 1_000_000,
            initial_max_stream_data_bidi_remote: 1_000_000,
            initial_max_stream_data_uni: 1_000_000,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            cc_algorithm: CongestionControl::Default,
            debug: false,
            capacity_min: 5,
            max_datagram_size: 1350,
            max_stream_body_size: 16 * 1024 * 1024,

            _priv: (),
        }
    }
}

/// Lowest TLS version accepted on TCP listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

/// Certificate chain and key in PEM files.
///
/// Required for HTTP/3 and for TLS on TCP listeners.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub min_version: TlsVersion,
}

impl TlsConfig {
    #[inline]
    pub fn new<C: Into<PathBuf>, K: Into<PathBuf>>(cert: C, key: K) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            min_version: TlsVersion::default(),
        }
    }
}
