//! State of one QUIC connection, shared by the receive loop, the idle timer
//! and the workers writing responses.
//!
//! Every access to the `quiche` connection goes through one mutex. Writers
//! that run out of stream capacity park on a [`Notify`] registered under
//! that mutex; the receive loop wakes the writers of every stream the
//! engine reports writable.

use crate::{
    errors::ErrorKind,
    http::request::RequestData,
    limits::QuicLimits,
    pool::{thread_pool::ThreadPool, timer::TimerPool},
    server::dispatch::Site,
};
use dashmap::DashMap;
use quiche::h3;
use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Length of the connection ids this server issues.
pub(crate) const CONN_ID_LEN: usize = 16;

/// `H3_INTERNAL_ERROR`
pub(crate) const H3_INTERNAL_ERROR: u64 = 0x102;

/// Everything the QUIC side of a server shares.
pub(crate) struct QuicContext {
    pub(crate) table: DashMap<Vec<u8>, Arc<QuicConnIo>>,
    /// Non-blocking handle on the listening socket, usable from any thread
    pub(crate) socket: UdpSocket,
    pub(crate) pool: ThreadPool,
    pub(crate) timers: TimerPool,
    pub(crate) site: Arc<Site>,
    pub(crate) limits: QuicLimits,
    /// Queue level of stream tasks
    pub(crate) level: usize,
}

impl QuicContext {
    /// `false` when the socket would block and `datagram` should be kept.
    fn send(&self, datagram: &[u8], to: SocketAddr) -> bool {
        match self.socket.send_to(datagram, to) {
            Ok(_) => {
                if self.limits.debug {
                    debug!("sent {} bytes to {to}", datagram.len());
                }
                true
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(err) => {
                debug!("udp send to {to} failed: {err}");
                true
            }
        }
    }

    /// Sends a datagram that belongs to no connection (retry, negotiation).
    pub(crate) fn send_raw(&self, datagram: &[u8], to: SocketAddr) {
        if !self.send(datagram, to) {
            debug!("dropped {} bytes to {to}: socket busy", datagram.len());
        }
    }

    #[inline]
    pub(crate) fn find(&self, id: &[u8]) -> Option<Arc<QuicConnIo>> {
        self.table.get(id).map(|entry| entry.value().clone())
    }
}

/// A request whose body is still arriving.
pub(crate) struct PendingStream {
    pub(crate) data: RequestData,
    pub(crate) body: Vec<u8>,
}

pub(crate) struct QuicState {
    pub(crate) conn: quiche::Connection,
    pub(crate) h3: Option<h3::Connection>,
    pub(crate) streams: HashMap<u64, PendingStream>,
    /// Datagrams the socket refused, oldest first
    pending: VecDeque<(Vec<u8>, SocketAddr)>,
}

/// Outcome of one write attempt on a stream.
pub(crate) enum Sent {
    /// Bytes taken by the engine, the whole input
    Done(usize),
    /// Bytes taken so far; wait on the notify before trying again
    Blocked(usize, Arc<Notify>),
}

pub(crate) struct QuicConnIo {
    pub(crate) id: Vec<u8>,
    pub(crate) peer: SocketAddr,
    state: Mutex<QuicState>,
    waiters: Mutex<HashMap<u64, Arc<Notify>>>,
    closed: AtomicBool,
    timer: AtomicU64,
}

impl QuicConnIo {
    pub(crate) fn new(id: Vec<u8>, peer: SocketAddr, conn: quiche::Connection) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            state: Mutex::new(QuicState {
                conn,
                h3: None,
                streams: HashMap::new(),
                pending: VecDeque::new(),
            }),
            waiters: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            timer: AtomicU64::new(0),
        })
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, QuicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_error() -> ErrorKind {
        ErrorKind::Engine("connection closed".into())
    }

    /// Sends everything the engine has queued, then re-arms the idle timer
    /// or tears the connection down.
    pub(crate) fn flush(self: &Arc<Self>, state: &mut QuicState, ctx: &Arc<QuicContext>) {
        while let Some((datagram, to)) = state.pending.pop_front() {
            if !ctx.send(&datagram, to) {
                state.pending.push_front((datagram, to));
                break;
            }
        }

        let mut out = vec![0; ctx.limits.max_datagram_size];
        loop {
            match state.conn.send(&mut out) {
                Ok((len, info)) => {
                    if !state.pending.is_empty() || !ctx.send(&out[..len], info.to) {
                        state.pending.push_back((out[..len].to_vec(), info.to));
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(err) => {
                    debug!("cannot build a packet for {}: {err}", self.peer);
                    let _ = state.conn.close(false, 0x1, b"internal error");
                    break;
                }
            }
        }

        match state.conn.is_closed() {
            true => self.close(state, ctx),
            false => self.schedule(state, ctx),
        }
    }

    fn schedule(self: &Arc<Self>, state: &QuicState, ctx: &Arc<QuicContext>) {
        ctx.timers.remove_timer(self.timer.swap(0, Ordering::AcqRel));

        if let Some(after) = state.conn.timeout() {
            let conn = self.clone();
            let shared = ctx.clone();
            let id = ctx.timers.append_timer(after, move || conn.on_timeout(&shared));
            self.timer.store(id, Ordering::Release);
        }
    }

    /// Idle timer callback.
    pub(crate) fn on_timeout(self: &Arc<Self>, ctx: &Arc<QuicContext>) {
        if self.is_closed() {
            return;
        }

        let mut state = self.lock();
        state.conn.on_timeout();
        self.flush(&mut state, ctx);
    }

    /// Runs once: erases the table entry, logs the statistics and releases
    /// every parked writer.
    fn close(&self, state: &mut QuicState, ctx: &QuicContext) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        ctx.table.remove(&self.id);
        ctx.timers.remove_timer(self.timer.swap(0, Ordering::AcqRel));
        state.streams.clear();
        state.pending.clear();

        let stats = state.conn.stats();
        let (rtt, cwnd) = state
            .conn
            .path_stats()
            .next()
            .map(|path| (path.rtt, path.cwnd))
            .unwrap_or_default();

        info!(
            "connection closed, recv={} sent={} lost={} rtt={:?} cwnd={}",
            stats.recv, stats.sent, stats.lost, rtt, cwnd
        );

        let waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        for waiter in waiters.values() {
            waiter.notify_one();
        }
    }

    /// Wakes the writers of every stream with capacity again.
    pub(crate) fn wake_writable(&self, state: &mut QuicState) {
        let waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if waiters.is_empty() {
            return;
        }

        for stream_id in state.conn.writable() {
            if let Some(waiter) = waiters.get(&stream_id) {
                waiter.notify_one();
            }
        }
    }

    fn waiter(&self, stream_id: u64) -> Arc<Notify> {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream_id)
            .or_default()
            .clone()
    }

    pub(crate) fn forget_waiter(&self, stream_id: u64) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream_id);
    }

    /// Queues the response headers of `stream_id`.
    pub(crate) fn send_response(
        self: &Arc<Self>,
        stream_id: u64,
        headers: &[h3::Header],
        fin: bool,
        ctx: &Arc<QuicContext>,
    ) -> Result<Option<Arc<Notify>>, ErrorKind> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }

        let mut state = self.lock();
        let QuicState { conn, h3, .. } = &mut *state;
        let h3 = h3.as_mut().ok_or_else(Self::closed_error)?;

        let blocked = match h3.send_response(conn, stream_id, headers, fin) {
            Ok(()) => None,
            Err(h3::Error::StreamBlocked) => Some(self.waiter(stream_id)),
            Err(err) => return Err(err.into()),
        };

        self.flush(&mut state, ctx);
        Ok(blocked)
    }

    /// Writes as much of `body` as the stream takes now.
    ///
    /// Below `capacity_min` bytes of room the writer waits instead of
    /// sending a sliver, unless the rest of the body is that small.
    pub(crate) fn send_body(
        self: &Arc<Self>,
        stream_id: u64,
        body: &[u8],
        fin: bool,
        ctx: &Arc<QuicContext>,
    ) -> Result<Sent, ErrorKind> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }

        let mut state = self.lock();
        let QuicState { conn, h3, .. } = &mut *state;
        let h3 = h3.as_mut().ok_or_else(Self::closed_error)?;

        let capacity = conn.stream_capacity(stream_id)?;
        let written = match capacity < ctx.limits.capacity_min && capacity < body.len() {
            true => None,
            false => match h3.send_body(conn, stream_id, body, fin) {
                Ok(written) => Some(written),
                Err(h3::Error::Done) => None,
                Err(err) => return Err(err.into()),
            },
        };

        let sent = match written {
            Some(written) if written == body.len() => Sent::Done(written),
            other => Sent::Blocked(other.unwrap_or(0), self.waiter(stream_id)),
        };

        self.flush(&mut state, ctx);
        Ok(sent)
    }

    /// Resets both directions of `stream_id` after a failed response.
    pub(crate) fn abort_stream(self: &Arc<Self>, stream_id: u64, ctx: &Arc<QuicContext>) {
        if self.is_closed() {
            return;
        }

        let mut state = self.lock();
        let _ = state
            .conn
            .stream_shutdown(stream_id, quiche::Shutdown::Read, H3_INTERNAL_ERROR);
        let _ = state
            .conn
            .stream_shutdown(stream_id, quiche::Shutdown::Write, H3_INTERNAL_ERROR);
        self.flush(&mut state, ctx);
    }
}
