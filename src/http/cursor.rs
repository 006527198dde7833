//! Incremental reader over one fixed receive buffer.
//!
//! A [`Parser`] owns a single `Box<[u8]>` that is refilled in place from a
//! [`Source`]. Tokens that span two reads are copied into the caller's sink
//! as they go, so a refill never loses partial state.

use crate::errors::{ErrorKind, ProtocolError};
use memchr::{memchr, memchr2, memchr3};
use std::{future::Future, io, pin::Pin, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::sleep,
};

pub(crate) type ReadFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// Where the parser pulls bytes from.
pub(crate) trait Source: Send {
    fn read_into<'a>(&'a mut self, buf: &'a mut [u8]) -> ReadFuture<'a>;
}

/// A socket read raced against the keep-alive timer.
pub(crate) struct StreamSource<'s, S> {
    stream: &'s mut S,
    keep_alive: Duration,
}

impl<'s, S> StreamSource<'s, S> {
    #[inline]
    pub(crate) fn new(stream: &'s mut S, keep_alive: Duration) -> Self {
        Self { stream, keep_alive }
    }
}

impl<S: AsyncRead + Unpin + Send> Source for StreamSource<'_, S> {
    fn read_into<'a>(&'a mut self, buf: &'a mut [u8]) -> ReadFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;

                read_result = self.stream.read(buf) => read_result,
                _ = sleep(self.keep_alive) => {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
                },
            }
        })
    }
}

/// A source that is already exhausted, for bodies that arrived whole.
pub(crate) struct Exhausted;

impl Source for Exhausted {
    fn read_into<'a>(&'a mut self, _: &'a mut [u8]) -> ReadFuture<'a> {
        Box::pin(async { Ok(0) })
    }
}

#[derive(Debug)]
pub(crate) struct Parser {
    buffer: Box<[u8]>,
    len: usize,
    pos: usize,

    consumed: usize,
    head_limit: usize,
}

impl Parser {
    #[inline]
    pub(crate) fn new(block_size: usize, head_limit: usize) -> Self {
        Parser {
            buffer: vec![0; block_size.max(1)].into_boxed_slice(),
            len: 0,
            pos: 0,
            consumed: 0,
            head_limit,
        }
    }

    /// A parser whose window is `data`, used for HTTP/3 bodies.
    #[inline]
    pub(crate) fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len();
        let buffer = match data.is_empty() {
            true => vec![0; 1].into_boxed_slice(),
            false => data.into_boxed_slice(),
        };

        Parser {
            buffer,
            len,
            pos: 0,
            consumed: 0,
            head_limit: usize::MAX,
        }
    }

    /// Starts counting bytes against the header block budget.
    #[inline]
    pub(crate) fn start_head(&mut self) {
        self.consumed = 0;
    }

    #[inline(always)]
    pub(crate) fn window(&self) -> &[u8] {
        &self.buffer[self.pos..self.len]
    }

    #[inline(always)]
    pub(crate) fn is_drained(&self) -> bool {
        self.pos >= self.len
    }

    /// Reads into the buffer from offset 0, replacing the old window.
    pub(crate) async fn refill(&mut self, src: &mut dyn Source) -> Result<usize, ErrorKind> {
        let n = src.read_into(&mut self.buffer).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        self.len = n;
        self.pos = 0;
        Ok(n)
    }

    #[inline]
    pub(crate) async fn peek(&mut self, src: &mut dyn Source) -> Result<u8, ErrorKind> {
        if self.is_drained() {
            self.refill(src).await?;
        }
        Ok(self.buffer[self.pos])
    }

    /// Advances over `n` header bytes of the current window.
    #[inline]
    pub(crate) fn consume(&mut self, n: usize) -> Result<(), ErrorKind> {
        debug_assert!(self.pos + n <= self.len);

        self.pos += n;
        self.consumed += n;

        match self.consumed > self.head_limit {
            true => Err(ProtocolError::HeaderTooLarge.into()),
            false => Ok(()),
        }
    }

    /// Copies bytes into `out` until one of `delims` (at most three) is met.
    ///
    /// The delimiter is consumed but not copied and is returned. More than
    /// `max` bytes before it fail with `HeaderTooLarge`.
    pub(crate) async fn read_until(
        &mut self,
        src: &mut dyn Source,
        delims: &[u8],
        out: &mut Vec<u8>,
        max: usize,
    ) -> Result<u8, ErrorKind> {
        loop {
            if self.is_drained() {
                self.refill(src).await?;
            }

            let window = self.window();
            let found = match *delims {
                [a] => memchr(a, window),
                [a, b] => memchr2(a, b, window),
                [a, b, c] => memchr3(a, b, c, window),
                _ => return Err(ErrorKind::Config("read_until takes 1 to 3 delimiters".into())),
            };

            match found {
                Some(i) => {
                    let delim = window[i];
                    out.extend_from_slice(&window[..i]);
                    self.consume(i + 1)?;

                    if out.len() > max {
                        return Err(ProtocolError::HeaderTooLarge.into());
                    }
                    return Ok(delim);
                }
                None => {
                    let n = window.len();
                    out.extend_from_slice(window);
                    self.consume(n)?;

                    if out.len() > max {
                        return Err(ProtocolError::HeaderTooLarge.into());
                    }
                }
            }
        }
    }

    /// Takes up to `max` bytes left in the window without refilling.
    #[inline]
    pub(crate) fn take_remaining(&mut self, max: usize) -> &[u8] {
        let end = self.len.min(self.pos.saturating_add(max));
        let start = self.pos;
        self.pos = end;

        &self.buffer[start..end]
    }
}

/// Body bytes of one request: the window left after the head, then refills.
pub(crate) struct BodyStream<'c> {
    parser: &'c mut Parser,
    source: &'c mut dyn Source,
    total: usize,
    consumed: usize,
}

impl<'c> BodyStream<'c> {
    #[inline]
    pub(crate) fn new(parser: &'c mut Parser, source: &'c mut dyn Source, total: usize) -> Self {
        Self {
            parser,
            source,
            total,
            consumed: 0,
        }
    }

    #[inline]
    pub(crate) const fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub(crate) const fn remaining(&self) -> usize {
        self.total - self.consumed
    }

    /// Next slice of the body, `None` once `total` bytes were read.
    pub(crate) async fn chunk(&mut self) -> Result<Option<&[u8]>, ErrorKind> {
        if self.consumed >= self.total {
            return Ok(None);
        }

        if self.parser.is_drained() {
            self.parser.refill(self.source).await?;
        }

        let slice = self.parser.take_remaining(self.total - self.consumed);
        self.consumed += slice.len();

        Ok(Some(slice))
    }

    /// Skips the unread rest so the connection can serve the next request.
    pub(crate) async fn drain(&mut self) -> Result<(), ErrorKind> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ChunkedSource;

    #[tokio::test]
    async fn read_until_across_refills() {
        let input = b"GET /a/very/long/path HTTP/1.1\r\n";

        for size in 1..=input.len() {
            let mut src = ChunkedSource::new(input, size);
            let mut parser = Parser::new(size, 4096);

            let mut out = Vec::new();
            let delim = parser.read_until(&mut src, b" ", &mut out, 16).await;
            assert_eq!(delim, Ok(b' '));
            assert_eq!(out, b"GET");

            out.clear();
            parser.read_until(&mut src, b" ", &mut out, 64).await.unwrap();
            assert_eq!(out, b"/a/very/long/path", "size={size}");

            out.clear();
            parser.read_until(&mut src, b"\n", &mut out, 64).await.unwrap();
            assert_eq!(out, b"HTTP/1.1\r", "size={size}");

            assert_eq!(
                parser.peek(&mut src).await,
                Err(ProtocolError::ConnectionClosed.into())
            );
        }
    }

    #[tokio::test]
    async fn head_budget() {
        let mut src = ChunkedSource::new(b"0123456789 ", 4);
        let mut parser = Parser::new(4, 8);
        parser.start_head();

        let mut out = Vec::new();
        assert_eq!(
            parser.read_until(&mut src, b" ", &mut out, 64).await,
            Err(ProtocolError::HeaderTooLarge.into())
        );

        let mut src = ChunkedSource::new(b"0123456789 ", 4);
        let mut parser = Parser::new(4, 4096);
        let mut out = Vec::new();
        assert_eq!(
            parser.read_until(&mut src, b" ", &mut out, 5).await,
            Err(ProtocolError::HeaderTooLarge.into())
        );
    }

    #[tokio::test]
    async fn body_stream_prefix_then_refill() {
        let mut src = ChunkedSource::new(b"HEAD|body-bytes|NEXT", 5);
        let mut parser = Parser::new(5, 4096);

        let mut out = Vec::new();
        parser.read_until(&mut src, b"|", &mut out, 64).await.unwrap();
        assert_eq!(out, b"HEAD");

        let mut body = BodyStream::new(&mut parser, &mut src, 11);
        let mut collected = Vec::new();
        while let Some(chunk) = body.chunk().await.unwrap() {
            collected.extend_from_slice(chunk);
        }
        assert_eq!(collected, b"body-bytes|");
        assert_eq!(body.remaining(), 0);

        // The bytes after the body stay for the next request
        assert_eq!(parser.window(), b"NEXT");
    }

    #[tokio::test]
    async fn exhausted_body_is_closed() {
        let mut parser = Parser::from_bytes(b"abc".to_vec());
        let mut src = Exhausted;

        let mut body = BodyStream::new(&mut parser, &mut src, 5);
        assert_eq!(body.chunk().await.unwrap(), Some(&b"abc"[..]));
        assert_eq!(
            body.chunk().await,
            Err(ProtocolError::ConnectionClosed.into())
        );
    }
}
