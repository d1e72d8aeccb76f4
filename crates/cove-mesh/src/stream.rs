//! Byte-stream surface over a message-oriented data channel.
//!
//! Data channels deliver whole messages; callers of the adapter want ordinary
//! reads and writes of arbitrary size. [`ChannelStream`] reassembles inbound
//! messages into a continuous byte stream and chunks outbound writes into
//! messages no larger than [`MAX_MESSAGE_LEN`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Largest message handed to the underlying data channel per write.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

/// A reliable, ordered duplex byte stream to one channel of one remote peer.
///
/// Reading returns EOF once the transport closes; writing after the stream is
/// shut down (or after the transport closed) fails with `BrokenPipe`.
#[derive(Debug)]
pub struct ChannelStream {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

/// The transport-facing ends of a [`ChannelStream`].
pub(crate) struct StreamEnds {
    /// Feed messages read from the data channel here; drop it to signal EOF.
    pub inbound_tx: mpsc::UnboundedSender<Bytes>,
    /// Messages to send on the data channel; closes when the caller shuts the
    /// stream down.
    pub outbound_rx: mpsc::UnboundedReceiver<Bytes>,
}

pub(crate) fn pair() -> (ChannelStream, StreamEnds) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        ChannelStream {
            inbound: inbound_rx,
            leftover: Bytes::new(),
            outbound: Some(outbound_tx),
        },
        StreamEnds {
            inbound_tx,
            outbound_rx,
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.leftover = chunk,
                // Transport closed: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(tx) = this.outbound.as_ref() else {
            return Poll::Ready(Err(broken_pipe()));
        };
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_MESSAGE_LEN);
        match tx.send(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reads_span_message_boundaries() {
        let (mut stream, ends) = pair();
        ends.inbound_tx.send(Bytes::from_static(b"hel")).unwrap();
        ends.inbound_tx.send(Bytes::from_static(b"lo ")).unwrap();
        ends.inbound_tx.send(Bytes::from_static(b"world")).unwrap();

        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn partial_reads_keep_leftover() {
        let (mut stream, ends) = pair();
        ends.inbound_tx.send(Bytes::from_static(b"abcdef")).unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"cdef");
    }

    #[tokio::test]
    async fn eof_after_transport_close() {
        let (mut stream, ends) = pair();
        ends.inbound_tx.send(Bytes::from_static(b"tail")).unwrap();
        drop(ends.inbound_tx);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"tail");
    }

    #[tokio::test]
    async fn writes_are_chunked() {
        let (mut stream, mut ends) = pair();
        let payload = vec![7u8; MAX_MESSAGE_LEN * 2 + 100];
        stream.write_all(&payload).await.unwrap();

        let mut sizes = Vec::new();
        while let Ok(chunk) = ends.outbound_rx.try_recv() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![MAX_MESSAGE_LEN, MAX_MESSAGE_LEN, 100]);
    }

    #[tokio::test]
    async fn write_after_shutdown_fails() {
        let (mut stream, mut ends) = pair();
        stream.shutdown().await.unwrap();
        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(ends.outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_after_transport_close_fails() {
        let (mut stream, ends) = pair();
        drop(ends.outbound_rx);
        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
