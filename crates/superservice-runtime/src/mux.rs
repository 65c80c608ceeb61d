//! Connection multiplexer
//!
//! Splits one TCP listener into an RPC listener and an HTTP listener. Every
//! accepted connection is sniffed before it is handed over:
//!
//! - HTTP/2 connections whose first request carries a `content-type`
//!   starting with `application/grpc` go to the RPC listener
//! - HTTP/1 requests and every other HTTP/2 connection go to the HTTP listener
//! - anything else is dropped
//!
//! Sniffed bytes are kept and replayed by [`MuxedStream`], so the sub-server
//! reads the connection from its first byte. Nothing is written to the peer
//! while sniffing.

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use pin_project::pin_project;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use superservice_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, error, trace, warn};

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// Upper bound on bytes buffered while looking for the first request headers
const MAX_SNIFF_BYTES: usize = 64 * 1024;

/// Pending connections per virtual listener
const QUEUE_DEPTH: usize = 128;

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Sub-server a connection is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// gRPC over HTTP/2
    Rpc,
    /// HTTP/1.x and non-gRPC HTTP/2
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rpc => write!(f, "grpc"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Matched(Protocol),
    Incomplete,
    Unknown,
}

fn sniff(buf: &[u8]) -> Sniff {
    if buf.len() < HTTP2_PREFACE.len() {
        if HTTP2_PREFACE.starts_with(buf) {
            return Sniff::Incomplete;
        }
    } else if buf.starts_with(HTTP2_PREFACE) {
        return sniff_http2(&buf[HTTP2_PREFACE.len()..]);
    }
    sniff_http1(buf)
}

fn sniff_http1(buf: &[u8]) -> Sniff {
    let mut possible = false;
    for method in HTTP1_METHODS {
        if buf.starts_with(method) {
            return Sniff::Matched(Protocol::Http);
        }
        possible |= method.starts_with(buf);
    }
    if possible {
        Sniff::Incomplete
    } else {
        Sniff::Unknown
    }
}

/// Walk the frames after the preface up to the end of the first header block.
///
/// Malformed framing is routed to HTTP so the HTTP/2 server reports it.
fn sniff_http2(mut frames: &[u8]) -> Sniff {
    let mut block = Vec::new();
    let mut in_headers = false;

    loop {
        if frames.len() < FRAME_HEADER_LEN {
            return Sniff::Incomplete;
        }
        let len = u32::from_be_bytes([0, frames[0], frames[1], frames[2]]) as usize;
        let kind = frames[3];
        let flags = frames[4];
        if frames.len() < FRAME_HEADER_LEN + len {
            return Sniff::Incomplete;
        }
        let mut payload = &frames[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        frames = &frames[FRAME_HEADER_LEN + len..];

        match kind {
            FRAME_HEADERS if !in_headers => {
                if flags & FLAG_PADDED != 0 {
                    let Some((&pad, rest)) = payload.split_first() else {
                        return Sniff::Matched(Protocol::Http);
                    };
                    let pad = pad as usize;
                    if pad > rest.len() {
                        return Sniff::Matched(Protocol::Http);
                    }
                    payload = &rest[..rest.len() - pad];
                }
                if flags & FLAG_PRIORITY != 0 {
                    if payload.len() < 5 {
                        return Sniff::Matched(Protocol::Http);
                    }
                    payload = &payload[5..];
                }
                block.extend_from_slice(payload);
                in_headers = true;
            }
            FRAME_CONTINUATION if in_headers => block.extend_from_slice(payload),
            // header block interrupted by another frame
            _ if in_headers => return Sniff::Matched(Protocol::Http),
            _ => continue,
        }

        if flags & FLAG_END_HEADERS != 0 {
            return Sniff::Matched(classify_headers(&block));
        }
    }
}

fn classify_headers(block: &[u8]) -> Protocol {
    let mut decoder = hpack::Decoder::new();
    match decoder.decode(block) {
        Ok(headers) => {
            let grpc = headers.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case(b"content-type") && value.starts_with(b"application/grpc")
            });
            if grpc {
                Protocol::Rpc
            } else {
                Protocol::Http
            }
        }
        Err(e) => {
            debug!(error = ?e, "Failed to decode HTTP/2 header block");
            Protocol::Http
        }
    }
}

/// Read from `stream` until its protocol is known
async fn detect(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<Option<Protocol>> {
    loop {
        match sniff(buf) {
            Sniff::Matched(protocol) => return Ok(Some(protocol)),
            Sniff::Unknown => return Ok(None),
            Sniff::Incomplete => {}
        }

        if buf.len() >= MAX_SNIFF_BYTES {
            let http2 = buf.starts_with(HTTP2_PREFACE);
            return Ok(http2.then_some(Protocol::Http));
        }

        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn route(
    mut stream: TcpStream,
    peer: SocketAddr,
    sniff_timeout: Duration,
    rpc: mpsc::Sender<MuxedStream>,
    http: mpsc::Sender<MuxedStream>,
) {
    let mut buf = BytesMut::with_capacity(1024);

    let protocol = match tokio::time::timeout(sniff_timeout, detect(&mut stream, &mut buf)).await
    {
        Ok(Ok(Some(protocol))) => protocol,
        Ok(Ok(None)) => {
            warn!(peer = %peer, sniffed = buf.len(), "Dropping connection with unrecognized protocol");
            return;
        }
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Connection failed while sniffing protocol");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?sniff_timeout, "Timed out sniffing connection protocol");
            return;
        }
    };

    trace!(peer = %peer, protocol = %protocol, "Routing connection");
    let queue = match protocol {
        Protocol::Rpc => rpc,
        Protocol::Http => http,
    };
    if queue.send(MuxedStream::new(buf.freeze(), stream)).await.is_err() {
        debug!(peer = %peer, protocol = %protocol, "Listener closed, dropping connection");
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

/// Splits one listener into per-protocol virtual listeners
#[derive(Debug)]
pub struct Multiplexer {
    listener: TcpListener,
    rpc: mpsc::Sender<MuxedStream>,
    http: mpsc::Sender<MuxedStream>,
    sniff_timeout: Duration,
}

impl Multiplexer {
    /// Wrap `listener`, returning the multiplexer and its RPC and HTTP listeners
    pub fn new(listener: TcpListener, sniff_timeout: Duration) -> (Self, MuxListener, MuxListener) {
        let (rpc_tx, rpc_rx) = mpsc::channel(QUEUE_DEPTH);
        let (http_tx, http_rx) = mpsc::channel(QUEUE_DEPTH);

        let mux = Self {
            listener,
            rpc: rpc_tx,
            http: http_tx,
            sniff_timeout,
        };
        let rpc = MuxListener {
            protocol: Protocol::Rpc,
            connections: rpc_rx,
        };
        let http = MuxListener {
            protocol: Protocol::Http,
            connections: http_rx,
        };

        (mux, rpc, http)
    }

    /// Address of the underlying listener
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and route connections until `token` is cancelled.
    ///
    /// Unroutable connections are dropped without interrupting the loop. The
    /// virtual listeners observe end of stream once this returns and every
    /// in-flight routing task has finished.
    pub async fn serve(self, token: CancellationToken) -> Result<()> {
        let Self {
            listener,
            rpc,
            http,
            sniff_timeout,
        } = self;

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Multiplexer stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Transient accept error");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Multiplexer accept failed");
                        return Err(Error::Io(e));
                    }
                },
            };

            trace!(peer = %peer, "Accepted connection");
            tokio::spawn(route(
                stream,
                peer,
                sniff_timeout,
                rpc.clone(),
                http.clone(),
            ));
        }
    }
}

/// Virtual listener yielding the connections routed to one protocol
#[derive(Debug)]
pub struct MuxListener {
    protocol: Protocol,
    connections: mpsc::Receiver<MuxedStream>,
}

impl MuxListener {
    /// Protocol served by this listener
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Next routed connection; `None` once the multiplexer has stopped
    pub async fn accept(&mut self) -> Option<MuxedStream> {
        self.connections.recv().await
    }
}

impl Stream for MuxListener {
    type Item = io::Result<MuxedStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.connections.poll_recv(cx).map(|conn| conn.map(Ok))
    }
}

/// Accepted connection that replays the bytes consumed while sniffing
#[pin_project]
#[derive(Debug)]
pub struct MuxedStream {
    prefix: Bytes,
    #[pin]
    inner: TcpStream,
}

impl MuxedStream {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }

    /// Remote address of the connection
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl AsyncRead for MuxedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl Connected for MuxedStream {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}
