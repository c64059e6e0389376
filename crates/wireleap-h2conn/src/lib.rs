#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)]

use bytes::Bytes;
use hyper::body::{HttpBody as _, Sender};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Keep-alive ping interval and timeout on broker connections.
///
/// A broker that stops answering pings for this long is treated as gone,
/// so dead tunnels do not linger.
const KEEP_ALIVE: Duration = Duration::from_secs(10);

/// An error establishing a tunnel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The tunnel URL was not a valid URI.
    #[error("invalid tunnel URI")]
    BadUri(#[from] http::uri::InvalidUri),
    /// The request could not be constructed.
    #[error("could not build tunnel request")]
    Request(#[from] http::Error),
    /// The transport failed.
    #[error("tunnel transport error")]
    Transport(#[from] hyper::Error),
    /// The broker answered with a non-success status.
    #[error("broker refused tunnel: status {0}")]
    Status(u16),
}

/// Build the shared h2c client forwarders use to reach the broker.
///
/// Prior-knowledge HTTP/2 over plain TCP; keep-alive pings bound how long
/// a vanished broker can hold tunnels open.
pub fn h2c_client() -> Client<HttpConnector> {
    Client::builder()
        .http2_only(true)
        .http2_keep_alive_interval(KEEP_ALIVE)
        .http2_keep_alive_timeout(KEEP_ALIVE)
        .http2_keep_alive_while_idle(true)
        .build_http()
}

/// One tunneled flow: an `AsyncRead + AsyncWrite` stream stapled over a
/// request body (written) and a response body (read).
#[derive(Debug)]
pub struct H2Conn {
    /// Writer half; `None` after shutdown, which ends the request body.
    send: Option<Sender>,
    /// Reader half.
    recv: Body,
    /// Bytes received but not yet handed to the reader.
    leftover: Bytes,
}

impl H2Conn {
    /// Staple an existing sender/body pair into a stream.
    ///
    /// The broker side uses this directly with the request body it
    /// received and the response body it is producing.
    pub fn from_parts(send: Sender, recv: Body) -> Self {
        H2Conn {
            send: Some(send),
            recv,
            leftover: Bytes::new(),
        }
    }

    /// Open a tunnel by issuing `PUT url` with the given headers.
    ///
    /// Returns once the broker has answered with success headers; after
    /// that the stream is live in both directions.
    pub async fn connect(
        client: &Client<HttpConnector>,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Self, Error> {
        let uri: http::Uri = url.parse()?;
        let (send, req_body) = Body::channel();
        let mut req = Request::builder().method(Method::PUT).uri(uri);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let req = req.body(req_body)?;
        let resp = client.request(req).await?;
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status().as_u16()));
        }
        Ok(H2Conn::from_parts(send, resp.into_body()))
    }
}

impl AsyncRead for H2Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = buf.remaining().min(this.leftover.len());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.recv).poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.leftover = chunk;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for H2Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let send = match this.send.as_mut() {
            Some(s) => s,
            None => {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
        };
        match send.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
            }
            Poll::Pending => return Poll::Pending,
        }
        match send.try_send_data(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => {
                // poll_ready said yes but the channel filled in between;
                // try again on the next wakeup.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Data chunks are handed to the h2 layer eagerly in poll_write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the sender ends the request body, signalling EOF to
        // the peer.
        let this = self.get_mut();
        this.send.take();
        Poll::Ready(Ok(()))
    }
}
