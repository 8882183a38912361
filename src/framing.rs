//! Line buffering for streamed node replies.
//!
//! Nodes stream newline-delimited JSON, but the network is free to split a
//! line across packets. [`LineBufferedStream`] accumulates bytes and yields
//! one complete line per item, so every chunk forwarded to a caller is a
//! whole JSON document. A line that grows past the configured limit ends the
//! stream with [`LineTooLong`].

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line exceeds {limit} bytes without a newline")]
pub struct LineTooLong {
    pub limit: usize,
}

pub struct LineBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to contain no newline.
    scanned: usize,
    max_line: usize,
    finished: bool,
}

impl<S> LineBufferedStream<S> {
    pub fn new(inner: S, max_line: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line,
            finished: false,
        }
    }
}

impl<S, E> Stream for LineBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: From<LineTooLong>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            if let Some(pos) = this.buffer[this.scanned..].iter().position(|&b| b == b'\n') {
                let line = this.buffer.split_to(this.scanned + pos + 1);
                this.scanned = 0;
                // Keep-alive blank lines carry nothing for the caller.
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                return Poll::Ready(Some(Ok(line.freeze())));
            }
            this.scanned = this.buffer.len();

            if this.buffer.len() > this.max_line {
                this.finished = true;
                this.buffer.clear();
                this.scanned = 0;
                return Poll::Ready(Some(Err(E::from(LineTooLong {
                    limit: this.max_line,
                }))));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    // A partial line after an error is never completed.
                    this.finished = true;
                    this.buffer.clear();
                    this.scanned = 0;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    // Flush a trailing line that lacks its newline.
                    this.finished = true;
                    if this.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                        this.buffer.clear();
                        return Poll::Ready(None);
                    }
                    let remaining = this.buffer.split().freeze();
                    return Poll::Ready(Some(Ok(remaining)));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}
