use crate::{
    errors::ErrorKind,
    http::{
        cursor::{Exhausted, Parser},
        request::RequestData,
    },
    pool::thread_pool::{Task, Worker},
    quic::conn_io::{QuicConnIo, QuicContext, Sent},
    server::send::{write_plan, Plan, ResponseSink},
};
use quiche::h3;
use std::{io, sync::Arc};
use tokio::{sync::Notify, time::timeout};
use tracing::debug;

/// HTTP/3 framing on one request stream.
struct QuicSink<'a> {
    conn: &'a Arc<QuicConnIo>,
    ctx: &'a Arc<QuicContext>,
    stream_id: u64,
}

impl QuicSink<'_> {
    /// Waits for the receive loop to report room on the stream, at most
    /// one idle timeout.
    async fn park(&self, waiter: Arc<Notify>) -> Result<(), ErrorKind> {
        timeout(self.ctx.limits.max_idle_timeout, waiter.notified())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no stream capacity"))?;
        Ok(())
    }
}

impl ResponseSink for QuicSink<'_> {
    async fn send_head(&mut self, plan: &Plan, has_body: bool) -> Result<(), ErrorKind> {
        let mut headers = Vec::with_capacity(plan.headers.len() + 1);
        headers.push(h3::Header::new(b":status", plan.status.as_code_str().as_bytes()));
        headers.extend(
            plan.headers
                .iter()
                .map(|(name, value)| h3::Header::new(name.as_bytes(), value.as_bytes())),
        );

        loop {
            match self.conn.send_response(self.stream_id, &headers, !has_body, self.ctx)? {
                None => return Ok(()),
                Some(waiter) => self.park(waiter).await?,
            }
        }
    }

    async fn send_body(&mut self, chunk: &[u8], fin: bool) -> Result<(), ErrorKind> {
        let mut offset = 0;
        loop {
            match self.conn.send_body(self.stream_id, &chunk[offset..], fin, self.ctx)? {
                Sent::Done(_) => return Ok(()),
                Sent::Blocked(written, waiter) => {
                    offset += written;
                    self.park(waiter).await?;
                }
            }
        }
    }
}

/// A finished HTTP/3 request waiting for a worker.
pub(crate) struct QuicStreamTask {
    conn: Arc<QuicConnIo>,
    ctx: Arc<QuicContext>,
    stream_id: u64,
    request: Option<(RequestData, Vec<u8>)>,
}

impl QuicStreamTask {
    pub(crate) fn new(
        conn: Arc<QuicConnIo>,
        ctx: Arc<QuicContext>,
        stream_id: u64,
        data: RequestData,
        body: Vec<u8>,
    ) -> Self {
        Self {
            conn,
            ctx,
            stream_id,
            request: Some((data, body)),
        }
    }

    async fn serve(&self, data: RequestData, body: Vec<u8>) -> Result<(), ErrorKind> {
        let site = &self.ctx.site;

        // The whole body is already here
        let mut parser = Parser::from_bytes(body);
        let plan = site.serve(data, &mut parser, &mut Exhausted).await?;

        let mut sink = QuicSink {
            conn: &self.conn,
            ctx: &self.ctx,
            stream_id: self.stream_id,
        };
        write_plan(plan, &mut sink, site.resp_limits.socket_block_size).await
    }
}

impl Task for QuicStreamTask {
    fn run(&mut self, worker: &Worker) {
        let Some((data, body)) = self.request.take() else {
            return;
        };

        if let Err(err) = worker.block_on(self.serve(data, body)) {
            debug!("stream {} from {} failed: {err}", self.stream_id, self.conn.peer);
            self.conn.abort_stream(self.stream_id, &self.ctx);
        }
        self.conn.forget_waiter(self.stream_id);
    }
}
