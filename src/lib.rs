//! trellis_web - Dual-transport HTTP server core
//!
//! One router and one handler model served over HTTP/1.x on TCP (optionally
//! behind TLS) and over HTTP/3 on QUIC. Requests are parsed incrementally
//! from a fixed buffer, routed through a trie of literal and `[param]`
//! segments, and executed on a priority worker pool.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1 and HTTP/1.0**: persistent connections, `content-length` bodies
//! - **HTTPS**: rustls, TLS 1.2 or 1.3 floor, [`listen_tls`](ServerBuilder::listen_tls)
//! - **HTTP/3**: quiche with stateless retry, [`listen_quic`](ServerBuilder::listen_quic)
//!
//! # Features
//!
//! - **Trie router** with parameters, per-prefix error pages and layers
//! - **Body helpers**: text, JSON with [`Mask`] validation, urlencoded and
//!   multipart forms with streamed file parts
//! - **Files**: ranges, `gzip`/`deflate`/`br` with an on-disk cache, and
//!   placeholder replacement while streaming
//! - **Scheduling**: TCP connections and HTTP/3 streams share one pool of
//!   worker threads with priority levels
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use trellis_web::{Error, Handler, Request, Response, Server, StatusCode};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
//!         let name = req.param("name")?.to_string();
//!         resp.status(StatusCode::Ok).text(&format!("Hello, {name}!"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listen("127.0.0.1:8080".parse().unwrap())
//!         .get("/hello/[name]", Hello)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```
//! Error pages and layers:
//! ```no_run
//! use trellis_web::{Error, Handler, Method, Request, Response, Server, StatusCode};
//!
//! struct NeedsKey;
//!
//! impl Handler for NeedsKey {
//!     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
//!         if req.header("x-api-key").is_none() {
//!             req.stop_propagation();
//!             resp.status(StatusCode::Unauthorized).text("missing key")?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! struct ApiError;
//!
//! impl Handler for ApiError {
//!     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
//!         let message = req.error().map(|err| err.to_string()).unwrap_or_default();
//!         resp.text_with(|w| {
//!             w.write("api failure: ");
//!             w.write(&message);
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     # trellis_web::impt_default_handler!{ Items }
//!     Server::builder()
//!         .layer(Method::Get, "/api", NeedsKey)
//!         .error(Method::Get, "/api", ApiError)
//!         .get("/api/items", Items)
//!         .get_static("/assets", "./public")
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! # Use Cases
//!
//! - **Small services** that need HTTP/3 next to HTTP/1.1 without a proxy
//! - **Static sites** with compression and range requests
//! - **JSON APIs** with shape-checked bodies

pub(crate) mod http {
    pub(crate) mod cursor;
    pub(crate) mod form;
    pub mod query;
    pub(crate) mod replacer;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod uri;
}
pub(crate) mod pool {
    pub(crate) mod thread_pool;
    pub(crate) mod timer;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod dispatch;
    pub(crate) mod handler;
    pub(crate) mod send;
    pub(crate) mod server_impl;
    pub(crate) mod tls;
}
pub(crate) mod quic {
    pub(crate) mod conn_io;
    pub(crate) mod poll;
    pub(crate) mod stream;
    pub(crate) mod token;
}
pub mod compress;
pub(crate) mod errors;
pub mod limits;
pub(crate) mod mask;
pub(crate) mod router;

pub use crate::{
    errors::{ErrorKind as Error, IoError, ProtocolError},
    http::{
        form::FileData,
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Response,
        },
        types::{Method, StatusCode, Version},
    },
    mask::{Bounds, Field, Mask},
    server::{
        handler::Handler,
        send::{Upstream, Upstreamed},
        server_impl::{Server, ServerBuilder},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&mut Response)>(f: F) {
    f(&mut Response::new(
        &crate::limits::RespLimits::default(),
        std::sync::Arc::new(crate::compress::Compressors::default()),
    ));
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use trellis_web::{Error, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            async fn handle(&self, _: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
                resp.status(StatusCode::Ok).text("Hello world!")
            }
        }
    };
}

#[cfg(test)]
pub mod tools {
    use crate::http::cursor::{ReadFuture, Source};

    /// Serves `data` at most `size` bytes per read, then end of stream.
    pub struct ChunkedSource {
        data: Vec<u8>,
        pos: usize,
        size: usize,
    }

    impl ChunkedSource {
        pub fn new(data: &[u8], size: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                size: size.max(1),
            }
        }
    }

    impl Source for ChunkedSource {
        fn read_into<'a>(&'a mut self, buf: &'a mut [u8]) -> ReadFuture<'a> {
            let end = self.data.len().min(self.pos + self.size);
            let len = (end - self.pos).min(buf.len());

            buf[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
            self.pos += len;
            Box::pin(async move { Ok(len) })
        }
    }
}
