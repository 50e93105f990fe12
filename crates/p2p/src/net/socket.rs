//! Buffered non-blocking peer socket.

use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;
use std::time::Duration;

use crate::net::{Link, LocalTime};

/// A non-blocking socket with an outbound write queue.
///
/// Writes are queued and flushed when the underlying stream is ready. The
/// time the oldest unflushed byte has been waiting is tracked so the reactor
/// can close peers whose send queue stops draining.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// The remote peer address.
    pub address: net::SocketAddr,
    /// Whether this is an inbound or outbound connection.
    pub link: Link,
    /// Queued writes, oldest first. The front buffer may be partially
    /// written.
    queue: VecDeque<Vec<u8>>,
    /// When the currently-queued data started waiting to be flushed.
    queued_since: Option<LocalTime>,
}

impl<R: Read + Write> Socket<R> {
    /// Wrap a raw stream.
    pub fn from(raw: R, address: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            address,
            link,
            queue: VecDeque::new(),
            queued_since: None,
        }
    }

    /// Queue bytes for sending.
    pub fn push(&mut self, bytes: &[u8], now: LocalTime) {
        self.queue.push_back(bytes.to_vec());
        self.queued_since.get_or_insert(now);
    }

    /// Whether the send queue has failed to drain for longer than `limit`.
    pub fn stalled(&self, now: LocalTime, limit: Duration) -> bool {
        self.queued_since
            .map_or(false, |since| now - since >= limit)
    }

    /// Attempt to flush the queue to the underlying stream.
    ///
    /// Returns `WouldBlock` if the stream can't currently take more data;
    /// queued data is retained and the stall clock keeps running.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(buf) = self.queue.front_mut() {
            match self.raw.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) if n == buf.len() => {
                    self.queue.pop_front();
                }
                Ok(n) => {
                    buf.drain(..n);
                }
                Err(err) => return Err(err),
            }
        }
        self.queued_since = None;
        self.raw.flush()
    }
}

impl Socket<net::TcpStream> {
    /// The local address of this socket.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut down both halves of the connection.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

impl<R: Read + Write> Read for Socket<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stream with a byte budget; writes beyond it would block.
    struct Metered {
        budget: usize,
        written: Vec<u8>,
    }

    impl Read for Metered {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Metered {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.budget);
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn addr() -> net::SocketAddr {
        "127.0.0.1:9735".parse().unwrap()
    }

    #[test]
    fn partial_writes_are_retained() {
        let now = LocalTime::from_secs(1000);
        let mut socket = Socket::from(
            Metered {
                budget: 4,
                written: Vec::new(),
            },
            addr(),
            Link::Outbound,
        );

        socket.push(b"hello world", now);
        assert_eq!(
            socket.flush().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        // The stream becomes writable again.
        socket.raw.budget = 64;
        socket.flush().unwrap();

        assert_eq!(socket.raw.written, b"hello world");
        assert!(!socket.stalled(
            now + Duration::from_secs(60),
            Duration::from_secs(10)
        ));
    }

    #[test]
    fn stall_clock_runs_while_queued() {
        let now = LocalTime::from_secs(1000);
        let limit = Duration::from_secs(10);
        let mut socket = Socket::from(
            Metered {
                budget: 0,
                written: Vec::new(),
            },
            addr(),
            Link::Outbound,
        );

        assert!(!socket.stalled(now, limit));

        socket.push(b"data", now);
        assert!(socket.flush().is_err());

        assert!(!socket.stalled(now + Duration::from_secs(9), limit));
        assert!(socket.stalled(now + Duration::from_secs(10), limit));
    }

    #[test]
    fn writes_preserve_enqueue_order() {
        let now = LocalTime::from_secs(1000);
        let mut socket = Socket::from(
            Metered {
                budget: usize::MAX,
                written: Vec::new(),
            },
            addr(),
            Link::Outbound,
        );

        socket.push(b"one", now);
        socket.push(b"two", now);
        socket.push(b"three", now);
        socket.flush().unwrap();

        assert_eq!(socket.raw.written, b"onetwothree");
    }
}
