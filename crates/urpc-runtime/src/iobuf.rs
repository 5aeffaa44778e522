//! ByteStream: append-only byte accumulator
//!
//! Bytes enter at the tail (`append`, `append_from`) and leave from the
//! head (`consume`, `cut`, `drain_to`). Every operation tolerates asking
//! for more than is buffered: it acts on what is there, possibly nothing.
//!
//! ```text
//!   storage: [ consumed | readable .................. | spare ]
//!             0         head                         len
//! ```
//!
//! The consumed prefix is reclaimed lazily once it outgrows the readable
//! part, so a stream of small frames does not shift bytes on every cut.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;

/// Compact once at least this many consumed bytes sit in front of the data.
const COMPACT_MIN: usize = 4096;

#[derive(Default, Clone, PartialEq, Eq)]
pub struct ByteStream {
    data: Vec<u8>,
    head: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Readable bytes as one slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Move all of `other` onto the tail.
    pub fn append_stream(&mut self, other: ByteStream) {
        if self.is_empty() {
            *self = other;
        } else {
            self.append(other.as_slice());
        }
    }

    /// Up to `n` bytes from the head, not consumed.
    #[inline]
    pub fn peek(&self, n: usize) -> &[u8] {
        let s = self.as_slice();
        &s[..n.min(s.len())]
    }

    /// Drop up to `n` bytes from the head; returns how many were dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.head += n;
        if self.head == self.data.len() {
            self.clear();
        } else if self.head >= COMPACT_MIN && self.head > self.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
        n
    }

    /// Split off up to `n` head bytes into a new stream.
    pub fn cut(&mut self, n: usize) -> ByteStream {
        let n = n.min(self.len());
        if n == self.len() && self.head == 0 {
            return std::mem::take(self);
        }
        let out = ByteStream {
            data: self.peek(n).to_vec(),
            head: 0,
        };
        self.consume(n);
        out
    }

    /// Split off up to `n` head bytes as a plain vector.
    pub fn cut_to_vec(&mut self, n: usize) -> Vec<u8> {
        self.cut(n).into_vec()
    }

    /// Copy every readable byte onto the end of `dst`, leaving the stream intact.
    pub fn append_to(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(self.as_slice());
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        if self.head > 0 {
            self.data.drain(..self.head);
        }
        self.data
    }

    // ── Descriptor I/O ──

    /// One `read(2)` of at most `chunk` bytes onto the tail.
    ///
    /// `Ok(0)` is end of stream. `EAGAIN` and `EINTR` come back as errors for
    /// the caller to classify.
    pub fn append_from(&mut self, fd: BorrowedFd<'_>, chunk: usize) -> Result<usize, Errno> {
        let start = self.data.len();
        self.data.resize(start + chunk, 0);
        // SAFETY: the destination is `chunk` initialised bytes we own.
        let ret = unsafe {
            libc::read(
                fd.as_raw_fd(),
                self.data.as_mut_ptr().add(start) as *mut libc::c_void,
                chunk,
            )
        };
        match Errno::result(ret) {
            Ok(n) => {
                self.data.truncate(start + n as usize);
                Ok(n as usize)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// One `write(2)` from the head; written bytes are consumed.
    pub fn drain_to(&mut self, fd: BorrowedFd<'_>) -> Result<usize, Errno> {
        if self.is_empty() {
            return Ok(0);
        }
        let src = self.as_slice();
        // SAFETY: `src` is a live slice for the duration of the call.
        let ret = unsafe {
            libc::write(
                fd.as_raw_fd(),
                src.as_ptr() as *const libc::c_void,
                src.len(),
            )
        };
        let n = Errno::result(ret)? as usize;
        self.consume(n);
        Ok(n)
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(data: Vec<u8>) -> Self {
        Self { data, head: 0 }
    }
}

impl From<&[u8]> for ByteStream {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("len", &self.len())
            .field("head", &self.head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_partial_tolerant_ops() {
        let mut s = ByteStream::from(&b"hello"[..]);
        assert_eq!(s.peek(3), b"hel");
        assert_eq!(s.peek(99), b"hello");
        assert_eq!(s.consume(2), 2);
        assert_eq!(s.consume(99), 3);
        assert!(s.is_empty());
        assert_eq!(s.consume(1), 0);
        assert!(s.cut(4).is_empty());
    }

    #[test]
    fn test_cut_moves_prefix() {
        let mut s = ByteStream::new();
        s.append(b"abc");
        s.append(b"defg");
        let head = s.cut(4);
        assert_eq!(head.as_slice(), b"abcd");
        assert_eq!(s.as_slice(), b"efg");

        let rest = s.cut(10);
        assert_eq!(rest.as_slice(), b"efg");
        assert!(s.is_empty());
    }

    #[test]
    fn test_append_to_and_into_vec() {
        let mut s = ByteStream::from(b"xyz".to_vec());
        s.consume(1);
        let mut out = b">".to_vec();
        s.append_to(&mut out);
        assert_eq!(out, b">yz");
        assert_eq!(s.into_vec(), b"yz");
    }

    #[test]
    fn test_compaction_keeps_content() {
        let mut s = ByteStream::new();
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        s.append(&payload);
        s.consume(9_000);
        assert_eq!(s.len(), 1_000);
        assert_eq!(s.as_slice(), &payload[9_000..]);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut out = ByteStream::from(&b"ping"[..]);
        assert_eq!(out.drain_to(a.as_fd()).unwrap(), 4);
        assert!(out.is_empty());

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        let mut inbound = ByteStream::new();
        assert_eq!(inbound.append_from(a.as_fd(), 64).unwrap(), 4);
        assert_eq!(inbound.as_slice(), b"pong");
        assert_eq!(inbound.append_from(a.as_fd(), 64), Err(Errno::EAGAIN));
        assert_eq!(inbound.len(), 4);

        drop(b);
        assert_eq!(inbound.append_from(a.as_fd(), 64).unwrap(), 0);
    }
}
