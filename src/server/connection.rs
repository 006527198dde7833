use crate::{
    errors::{ErrorKind, ProtocolError},
    http::{
        cursor::{Parser, StreamSource},
        request::read_head,
    },
    limits::ConnLimits,
    pool::thread_pool::{Task, Worker},
    server::{
        dispatch::Site,
        send::{write_plan, TcpSink},
    },
};
use std::{io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// One HTTP/1.x connection: reads requests until keep-alive ends.
pub(crate) struct HttpConnection {
    site: Arc<Site>,
    limits: ConnLimits,
    connection: Connection,
    parser: Parser,
    peer: Option<SocketAddr>,
}

impl HttpConnection {
    #[inline]
    pub(crate) fn new(site: Arc<Site>, limits: ConnLimits, peer: Option<SocketAddr>) -> Self {
        let parser = Parser::new(
            site.req_limits.socket_block_size,
            site.req_limits.max_header_block_size,
        );

        Self {
            site,
            limits,
            connection: Connection::new(),
            parser,
            peer,
        }
    }

    /// Serves requests from `stream` until it closes or expires.
    ///
    /// A peer closing an idle connection, or letting it time out, is a
    /// clean end. Malformed requests close the connection without a response.
    pub(crate) async fn run<S>(&mut self, stream: &mut S) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.connection.reset();
        let head_limit = self.site.req_limits.max_header_block_size;

        loop {
            self.parser.start_head();
            let mut source = StreamSource::new(&mut *stream, self.limits.keep_alive);

            let mut data = match read_head(&mut self.parser, &mut source, head_limit).await {
                Ok(data) => data,
                Err(ErrorKind::Protocol(ProtocolError::ConnectionClosed)) => return Ok(()),
                Err(ErrorKind::Io(err)) if err.kind() == io::ErrorKind::TimedOut => return Ok(()),
                Err(err) => return Err(err),
            };
            data.peer = self.peer;

            let mut plan = self.site.serve(data, &mut self.parser, &mut source).await?;
            drop(source);

            self.connection.request_count += 1;
            plan.keep_alive &= !self.is_expired();
            let keep_alive = plan.keep_alive;

            let mut sink = TcpSink::new(&mut *stream, self.limits.socket_write_timeout);
            write_plan(plan, &mut sink, self.site.resp_limits.socket_block_size).await?;

            if !keep_alive {
                return Ok(());
            }
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.connection.request_count >= self.limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.limits.connection_lifetime
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

/// An accepted socket waiting for a worker.
pub(crate) struct TcpTask {
    stream: Option<std::net::TcpStream>,
    peer: SocketAddr,
    site: Arc<Site>,
    limits: ConnLimits,
    tls: Option<TlsAcceptor>,
}

impl TcpTask {
    pub(crate) fn new(
        stream: std::net::TcpStream,
        peer: SocketAddr,
        site: Arc<Site>,
        limits: ConnLimits,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            stream: Some(stream),
            peer,
            site,
            limits,
            tls,
        }
    }

    async fn serve(&mut self, stream: std::net::TcpStream) -> Result<(), ErrorKind> {
        // Registers the socket with the worker's runtime
        let mut stream = TcpStream::from_std(stream)?;
        let _ = stream.set_nodelay(true);

        let mut connection = HttpConnection::new(self.site.clone(), self.limits.clone(), Some(self.peer));
        match &self.tls {
            Some(acceptor) => {
                let mut stream = acceptor.accept(stream).await?;
                connection.run(&mut stream).await
            }
            None => connection.run(&mut stream).await,
        }
    }
}

impl Task for TcpTask {
    fn run(&mut self, worker: &Worker) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        if let Err(err) = worker.block_on(self.serve(stream)) {
            debug!("connection {} ended: {err}", self.peer);
        }
    }
}
