//! UDP receive loop: version negotiation, stateless retry, connection
//! setup and HTTP/3 events.
//!
//! ```text
//! datagram ── unknown dcid ── Initial? ── version ok? ── token? ── valid? ── accept
//!                 │             no: drop    no: negotiate  no: retry  no: drop
//!                 └─ known ── recv ── lazy h3 ── events ── wake writers ── flush
//! ```

use crate::{
    errors::{ErrorKind, ProtocolError},
    http::{
        request::RequestData,
        types::{Method, Version},
        uri,
    },
    limits::{QuicLimits, TlsConfig},
    quic::{
        conn_io::{PendingStream, QuicConnIo, QuicContext, QuicState, CONN_ID_LEN, H3_INTERNAL_ERROR},
        stream::QuicStreamTask,
        token::{mint_token, validate_token},
    },
};
use quiche::{
    h3::{self, NameValue},
    ConnectionId,
};
use rand::{rngs::OsRng, RngCore};
use socket2::{Domain, Protocol, Socket, Type};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// `H3_MESSAGE_ERROR`
const H3_MESSAGE_ERROR: u64 = 0x10e;
/// `H3_EXCESSIVE_LOAD`
const H3_EXCESSIVE_LOAD: u64 = 0x107;

fn pem_path(path: &Path) -> Result<&str, ErrorKind> {
    path.to_str()
        .ok_or_else(|| ErrorKind::Config(format!("non UTF-8 path {}", path.display())))
}

/// The `quiche` configuration for `limits`, with the certificate of `tls`.
pub(crate) fn engine_config(limits: &QuicLimits, tls: &TlsConfig) -> Result<quiche::Config, ErrorKind> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    config
        .load_cert_chain_from_pem_file(pem_path(&tls.cert)?)
        .map_err(|err| ErrorKind::Config(format!("bad certificate {}: {err}", tls.cert.display())))?;
    config
        .load_priv_key_from_pem_file(pem_path(&tls.key)?)
        .map_err(|err| ErrorKind::Config(format!("bad private key {}: {err}", tls.key.display())))?;
    config.set_application_protos(h3::APPLICATION_PROTOCOL)?;

    config.set_max_idle_timeout(u64::try_from(limits.max_idle_timeout.as_millis()).unwrap_or(u64::MAX));
    config.set_max_recv_udp_payload_size(limits.max_datagram_size);
    config.set_max_send_udp_payload_size(limits.max_datagram_size);
    config.set_initial_max_data(limits.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(limits.initial_max_stream_data_bidi_local);
    config.set_initial_max_stream_data_bidi_remote(limits.initial_max_stream_data_bidi_remote);
    config.set_initial_max_stream_data_uni(limits.initial_max_stream_data_uni);
    config.set_initial_max_streams_bidi(limits.initial_max_streams_bidi);
    config.set_initial_max_streams_uni(limits.initial_max_streams_uni);
    config.set_disable_active_migration(true);
    config.enable_early_data();

    if let Some(name) = limits.cc_algorithm.engine_name() {
        config
            .set_cc_algorithm_name(name)
            .map_err(|err| ErrorKind::Config(format!("congestion control {name}: {err}")))?;
    }

    Ok(config)
}

/// A bound UDP socket, blocking or not.
pub(crate) fn bind_udp(addr: SocketAddr) -> Result<std::net::UdpSocket, ErrorKind> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Request head of an HTTP/3 `HEADERS` frame.
fn request_data(list: &[h3::Header]) -> Result<RequestData, ErrorKind> {
    let mut method = None;
    let mut path = None;
    let mut headers = Vec::with_capacity(list.len());

    for header in list {
        let value = || String::from_utf8_lossy(header.value()).into_owned();

        match header.name() {
            b":method" => method = Some(Method::from_bytes(header.value())?),
            b":path" => path = Some(header.value()),
            b":authority" => headers.push(("host".to_string(), value())),
            name if name.starts_with(b":") => {}
            name => headers.push((String::from_utf8_lossy(name).to_ascii_lowercase(), value())),
        }
    }

    let method = method.ok_or(ProtocolError::InvalidMethod)?;
    let path = path.ok_or(ProtocolError::InvalidUri)?;
    let target = uri::decompose(path)?;
    let uri = simdutf8::basic::from_utf8(path)
        .map_err(|_| ProtocolError::InvalidUri)?
        .to_string();

    let mut data = RequestData::new(method, Version::Http3, uri, target);
    for (name, value) in headers {
        data.insert_header(name, value);
    }
    data.parse_content_length()?;
    Ok(data)
}

pub(crate) struct QuicListener {
    socket: UdpSocket,
    local: SocketAddr,
    config: quiche::Config,
    h3_config: h3::Config,
    ctx: Arc<QuicContext>,
}

impl QuicListener {
    /// Wraps `socket`, whose non-blocking clone already lives in `ctx`.
    /// Must be called inside a Tokio runtime.
    pub(crate) fn new(
        socket: std::net::UdpSocket,
        config: quiche::Config,
        ctx: Arc<QuicContext>,
    ) -> Result<Self, ErrorKind> {
        let local = socket.local_addr()?;

        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            local,
            config,
            h3_config: h3::Config::new()?,
            ctx,
        })
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Receives datagrams until the worker pool stops.
    pub(crate) async fn run(mut self) {
        info!("http/3 listening on {}", self.local);
        let mut buf = vec![0; 65535];

        while !self.ctx.pool.is_stopped() {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    debug!("udp receive failed: {err}");
                    continue;
                }
            };

            match self.ctx.limits.debug {
                true => debug!("received {len} bytes from {from}"),
                false => trace!("received {len} bytes from {from}"),
            }
            self.on_datagram(&mut buf[..len], from);
        }
    }

    fn on_datagram(&mut self, pkt: &mut [u8], from: SocketAddr) {
        let conn = {
            let hdr = match quiche::Header::from_slice(pkt, quiche::MAX_CONN_ID_LEN) {
                Ok(hdr) => hdr,
                Err(err) => {
                    debug!("bad packet header from {from}: {err}");
                    return;
                }
            };

            match self.ctx.find(&hdr.dcid) {
                Some(conn) => conn,
                None => match self.accept(&hdr, from) {
                    Some(conn) => conn,
                    None => return,
                },
            }
        };

        self.receive(&conn, pkt, from);
    }

    fn accept(&mut self, hdr: &quiche::Header<'_>, from: SocketAddr) -> Option<Arc<QuicConnIo>> {
        if hdr.ty != quiche::Type::Initial {
            debug!("{:?} packet for an unknown connection from {from}", hdr.ty);
            return None;
        }

        let mut out = vec![0; self.ctx.limits.max_datagram_size];

        if !quiche::version_is_supported(hdr.version) {
            info!("version negotiation with {from}");
            match quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut out) {
                Ok(len) => self.ctx.send_raw(&out[..len], from),
                Err(err) => debug!("version negotiation failed: {err}"),
            }
            return None;
        }

        let token = hdr.token.as_deref().unwrap_or_default();
        if token.is_empty() {
            let mut scid = [0; CONN_ID_LEN];
            OsRng.fill_bytes(&mut scid);
            let scid = ConnectionId::from_ref(&scid);
            let token = mint_token(&hdr.dcid, &from);

            debug!("stateless retry for {from}");
            match quiche::retry(&hdr.scid, &hdr.dcid, &scid, &token, hdr.version, &mut out) {
                Ok(len) => self.ctx.send_raw(&out[..len], from),
                Err(err) => debug!("retry failed: {err}"),
            }
            return None;
        }

        let Some(odcid) = validate_token(token, &from) else {
            warn!("invalid address validation token from {from}");
            return None;
        };

        if hdr.dcid.len() != CONN_ID_LEN {
            warn!("unexpected connection id length from {from}");
            return None;
        }

        let conn = match quiche::accept(&hdr.dcid, Some(&odcid), self.local, from, &mut self.config) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("cannot accept a connection from {from}: {err}");
                return None;
            }
        };

        info!("new connection from {from}");
        let io = QuicConnIo::new(hdr.dcid.to_vec(), from, conn);
        self.ctx.table.insert(io.id.clone(), io.clone());
        Some(io)
    }

    fn receive(&self, io: &Arc<QuicConnIo>, pkt: &mut [u8], from: SocketAddr) {
        if io.is_closed() {
            return;
        }

        let mut state = io.lock();
        let recv_info = quiche::RecvInfo {
            from,
            to: self.local,
        };

        if let Err(err) = state.conn.recv(pkt, recv_info) {
            debug!("recv from {from} failed: {err}");
        }

        if state.h3.is_none() && (state.conn.is_established() || state.conn.is_in_early_data()) {
            match h3::Connection::with_transport(&mut state.conn, &self.h3_config) {
                Ok(h3) => {
                    debug!("http/3 ready for {from}");
                    state.h3 = Some(h3);
                }
                Err(err) => {
                    warn!("cannot start http/3 for {from}: {err}");
                    let _ = state.conn.close(true, H3_INTERNAL_ERROR, b"h3 setup");
                }
            }
        }

        if state.h3.is_some() {
            self.poll_events(io, &mut state);
        }

        io.wake_writable(&mut state);
        io.flush(&mut state, &self.ctx);
    }

    fn poll_events(&self, io: &Arc<QuicConnIo>, state: &mut QuicState) {
        let QuicState {
            conn, h3, streams, ..
        } = state;
        let Some(h3) = h3.as_mut() else {
            return;
        };
        let max_body = self.ctx.limits.max_stream_body_size;
        let mut chunk = [0; 4096];

        loop {
            let (stream_id, event) = match h3.poll(conn) {
                Ok(polled) => polled,
                Err(h3::Error::Done) => break,
                Err(err) => {
                    debug!("http/3 poll on {} failed: {err}", io.peer);
                    break;
                }
            };

            match event {
                h3::Event::Headers { list, has_body: more_frames } => match request_data(&list) {
                    Ok(mut data) => {
                        data.peer = Some(io.peer);
                        match more_frames {
                            true => {
                                streams.insert(stream_id, PendingStream { data, body: Vec::new() });
                            }
                            false => self.dispatch(io, stream_id, data, Vec::new()),
                        }
                    }
                    Err(err) => {
                        debug!("bad request headers on stream {stream_id}: {err}");
                        let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Read, H3_MESSAGE_ERROR);
                        let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Write, H3_MESSAGE_ERROR);
                    }
                },

                h3::Event::Data => {
                    let mut overflow = false;
                    while let Ok(read) = h3.recv_body(conn, stream_id, &mut chunk) {
                        match streams.get_mut(&stream_id) {
                            Some(stream) if stream.body.len() + read <= max_body => {
                                stream.body.extend_from_slice(&chunk[..read]);
                            }
                            Some(_) => overflow = true,
                            None => {}
                        }
                    }

                    if overflow {
                        debug!("body over {max_body} bytes on stream {stream_id}");
                        streams.remove(&stream_id);
                        let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Read, H3_EXCESSIVE_LOAD);
                        let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Write, H3_EXCESSIVE_LOAD);
                    }
                }

                h3::Event::Finished => {
                    let Some(stream) = streams.remove(&stream_id) else {
                        continue;
                    };

                    if stream.data.body_size.is_none() && !stream.body.is_empty() {
                        debug!("body without content-length on stream {stream_id}");
                        let _ = conn.stream_shutdown(stream_id, quiche::Shutdown::Write, H3_MESSAGE_ERROR);
                        continue;
                    }
                    self.dispatch(io, stream_id, stream.data, stream.body);
                }

                h3::Event::Reset(code) => {
                    debug!("stream {stream_id} reset by {} with {code}", io.peer);
                    streams.remove(&stream_id);
                }

                h3::Event::PriorityUpdate => debug!("priority update on stream {stream_id}"),

                h3::Event::GoAway => debug!("goaway from {}", io.peer),

                #[allow(unreachable_patterns)]
                _ => {}
            }
        }
    }

    fn dispatch(&self, io: &Arc<QuicConnIo>, stream_id: u64, data: RequestData, body: Vec<u8>) {
        let task = QuicStreamTask::new(io.clone(), self.ctx.clone(), stream_id, data, body);

        if !self.ctx.pool.append_task(Box::new(task), self.ctx.level) {
            debug!("stream {stream_id} dropped: the pool is stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::{Compressors, FileCache},
        http::{request::Request, response::Response},
        limits::{ReqLimits, RespLimits},
        pool::{thread_pool::ThreadPool, timer::TimerPool},
        router::{Route, Target, UriPart},
        server::dispatch::Site,
        Handler,
    };
    use dashmap::DashMap;
    use std::{
        io::Write,
        time::{Duration, Instant},
    };

    struct Hello;

    impl Handler for Hello {
        async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), ErrorKind> {
            let name = req.param("name")?.to_string();
            resp.text(format!("hi {name} over {:?}", req.version()))
        }
    }

    fn header(name: &str, value: &str) -> h3::Header {
        h3::Header::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn headers_to_request() {
        let list = [
            header(":method", "POST"),
            header(":scheme", "https"),
            header(":authority", "example.com"),
            header(":path", "/a/b%20c?x=1"),
            header("Content-Length", "3"),
            header("x-tag", "one"),
        ];

        let data = request_data(&list).unwrap();
        assert_eq!(data.method, Method::Post);
        assert_eq!(data.version, Version::Http3);
        assert_eq!(data.uri, "/a/b%20c?x=1");
        assert_eq!(&data.path[..data.path_size()], ["a", "b c"]);
        assert_eq!(data.headers.get("host").map(String::as_str), Some("example.com"));
        assert_eq!(data.headers.get("content-length").map(String::as_str), Some("3"));
        assert_eq!(data.body_size, Some(3));

        #[rustfmt::skip]
        let broken = [
            vec![header(":path", "/")],
            vec![header(":method", "GET")],
            vec![header(":method", "BREW"), header(":path", "/")],
            vec![header(":method", "GET"), header(":path", "/"), header("content-length", "x")],
        ];
        for list in broken {
            assert!(request_data(&list).is_err());
        }
    }

    fn write_pem(dir: &Path) -> TlsConfig {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(cert.serialize_pem().unwrap().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(cert.serialize_private_key_pem().as_bytes())
            .unwrap();

        TlsConfig::new(cert_path, key_path)
    }

    fn client_config() -> quiche::Config {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
        config.verify_peer(false);
        config.set_application_protos(h3::APPLICATION_PROTOCOL).unwrap();
        config.set_max_idle_timeout(5000);
        config.set_max_recv_udp_payload_size(1350);
        config.set_max_send_udp_payload_size(1350);
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_stream_data_uni(1_000_000);
        config.set_initial_max_streams_bidi(100);
        config.set_initial_max_streams_uni(100);
        config.set_disable_active_migration(true);
        config
    }

    #[tokio::test]
    async fn hello_over_http3() {
        let dir = tempfile::tempdir().unwrap();
        let tls = write_pem(dir.path());
        let limits = QuicLimits::default();

        let mut router = UriPart::default();
        router
            .set_handler(Method::Get, "/hello/[name]", Target::Handler(Route::new("/hello/[name]", Arc::new(Hello))))
            .unwrap();
        let site = Arc::new(Site {
            router,
            req_limits: ReqLimits::default(),
            resp_limits: RespLimits::default(),
            compressors: Arc::new(Compressors::default()),
            cache: FileCache::new(dir.path().join("cache")),
            upstream: None,
            json_errors: true,
        });

        let pool = ThreadPool::new(2, 3).unwrap();
        let timers = TimerPool::new(pool.clone(), 2, Duration::from_millis(10));
        assert!(timers.start());

        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let ctx = Arc::new(QuicContext {
            table: DashMap::new(),
            socket: socket.try_clone().unwrap(),
            pool: pool.clone(),
            timers,
            site,
            limits: limits.clone(),
            level: 2,
        });
        let listener = QuicListener::new(socket, engine_config(&limits, &tls).unwrap(), ctx.clone()).unwrap();
        let server = listener.local_addr();
        tokio::spawn(listener.run());

        // A plain quiche client on the same runtime
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = client.local_addr().unwrap();
        let mut config = client_config();
        let scid = [0xba; CONN_ID_LEN];
        let mut conn = quiche::connect(
            Some("localhost"),
            &ConnectionId::from_ref(&scid),
            local,
            server,
            &mut config,
        )
        .unwrap();

        let mut h3_conn: Option<h3::Connection> = None;
        let mut status = None;
        let mut body = Vec::new();
        let mut finished = false;
        let mut out = [0; 1350];
        let mut buf = [0; 65535];
        let deadline = Instant::now() + Duration::from_secs(10);

        while !finished && Instant::now() < deadline {
            while let Ok((len, info)) = conn.send(&mut out) {
                client.send_to(&out[..len], info.to).await.unwrap();
            }

            let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
            match tokio::time::timeout(wait, client.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let _ = conn.recv(&mut buf[..len], quiche::RecvInfo { from, to: local });
                }
                _ => conn.on_timeout(),
            }

            if conn.is_established() && h3_conn.is_none() {
                let mut h3 = h3::Connection::with_transport(&mut conn, &h3::Config::new().unwrap()).unwrap();
                let request = [
                    header(":method", "GET"),
                    header(":scheme", "https"),
                    header(":authority", "localhost"),
                    header(":path", "/hello/quic"),
                ];
                h3.send_request(&mut conn, &request, true).unwrap();
                h3_conn = Some(h3);
            }

            if let Some(h3) = h3_conn.as_mut() {
                loop {
                    match h3.poll(&mut conn) {
                        Ok((_, h3::Event::Headers { list, .. })) => {
                            status = list
                                .iter()
                                .find(|h| h.name() == b":status")
                                .map(|h| h.value().to_vec());
                        }
                        Ok((stream_id, h3::Event::Data)) => {
                            while let Ok(read) = h3.recv_body(&mut conn, stream_id, &mut buf) {
                                body.extend_from_slice(&buf[..read]);
                            }
                        }
                        Ok((_, h3::Event::Finished)) => finished = true,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        }

        assert!(finished, "no response before the deadline");
        assert_eq!(status.as_deref(), Some(&b"200"[..]));
        assert_eq!(body, b"hi quic over Http3");
        assert_eq!(ctx.table.len(), 1);

        pool.stop();
    }
}
