//! Decoding of the DATA section: dot-unstuffing up to the lone `.` line.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    LineStart,
    Dot,
    DotCr,
    Body,
    Done,
}

/// Reads the message body of a DATA command.
///
/// Yields the body bytes with leading dots unstuffed and stops at the
/// terminating `.` line, leaving anything pipelined after it in the
/// underlying buffer. A read that makes no progress for `idle_timeout`
/// fails with `TimedOut`.
pub struct DotReader<R> {
    inner: R,
    state: State,
    pending: Option<u8>,
    idle_timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    failed: bool,
}

impl<R: AsyncBufRead + Unpin> DotReader<R> {
    pub fn new(inner: R, idle_timeout: Duration) -> Self {
        Self {
            inner,
            state: State::LineStart,
            pending: None,
            idle_timeout,
            sleep: Box::pin(tokio::time::sleep(idle_timeout)),
            failed: false,
        }
    }

    /// The terminator has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done && self.pending.is_none()
    }

    /// The underlying stream failed or went idle; its framing is lost.
    pub fn failed(&self) -> bool {
        self.failed
    }
}

fn after(byte: u8) -> State {
    if byte == b'\n' {
        State::LineStart
    } else {
        State::Body
    }
}

fn step(state: &mut State, pending: &mut Option<u8>, byte: u8, out: &mut ReadBuf<'_>) {
    match *state {
        State::LineStart if byte == b'.' => *state = State::Dot,
        State::LineStart | State::Body => {
            out.put_slice(&[byte]);
            *state = after(byte);
        }
        State::Dot => match byte {
            b'\r' => *state = State::DotCr,
            b'\n' => *state = State::Done,
            _ => {
                out.put_slice(&[byte]);
                *state = after(byte);
            }
        },
        State::DotCr if byte == b'\n' => *state = State::Done,
        State::DotCr => {
            out.put_slice(b"\r");
            if out.remaining() > 0 {
                out.put_slice(&[byte]);
            } else {
                *pending = Some(byte);
            }
            *state = after(byte);
        }
        State::Done => {}
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if let Some(byte) = this.pending {
                if out.remaining() == 0 {
                    return Poll::Ready(Ok(()));
                }
                out.put_slice(&[byte]);
                this.pending = None;
            }
            if this.state == State::Done || out.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let filled_before = out.filled().len();
            let consumed = {
                let DotReader {
                    inner,
                    state,
                    pending,
                    sleep,
                    failed,
                    ..
                } = &mut *this;

                let available = match Pin::new(&mut *inner).poll_fill_buf(cx) {
                    Poll::Ready(Ok(buf)) => buf,
                    Poll::Ready(Err(err)) => {
                        *failed = true;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Pending => {
                        if sleep.as_mut().poll(cx).is_ready() {
                            *failed = true;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "timed out reading message data",
                            )));
                        }
                        return Poll::Pending;
                    }
                };
                if available.is_empty() {
                    *failed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before end of data",
                    )));
                }

                let mut consumed = 0;
                for &byte in available {
                    if *state == State::Done || pending.is_some() || out.remaining() == 0 {
                        break;
                    }
                    step(state, pending, byte, out);
                    consumed += 1;
                }
                consumed
            };

            Pin::new(&mut this.inner).consume(consumed);
            let deadline = Instant::now() + this.idle_timeout;
            this.sleep.as_mut().reset(deadline);

            if out.filled().len() > filled_before {
                return Poll::Ready(Ok(()));
            }
        }
    }
}
