//! Growable byte buffer with prepend space and scatter reads.
//!
//! The buffer is a single contiguous allocation split into three regions:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0                read_idx          write_idx            len
//! ```
//!
//! Readable bytes are data received or produced but not yet consumed.
//! The prepend region lets a producer write a length prefix in front of an
//! already-encoded payload without shifting it.

use std::io;
use std::os::fd::RawFd;

/// Reserved prepend space at the front of a fresh buffer.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Byte buffer with regions [prependable | readable | writable].
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `initial` bytes of writable space.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            read_idx: CHEAP_PREPEND,
            write_idx: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_idx
    }

    /// Number of bytes available in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.read_idx
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_idx..self.write_idx]
    }

    /// Position of the first CRLF in the readable region, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Consume `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_idx += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume everything, resetting both indices to the prepend mark.
    pub fn retrieve_all(&mut self) {
        self.read_idx = CHEAP_PREPEND;
        self.write_idx = CHEAP_PREPEND;
    }

    /// Consume `n` bytes and return them as a string (lossy on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..n]).into_owned();
        self.retrieve(n);
        s
    }

    /// Consume the whole readable region as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append bytes, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Append a u32 in network byte order.
    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    /// Read a u32 in network byte order without consuming it.
    ///
    /// Requires at least four readable bytes.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(bytes)
    }

    /// Read and consume a u32 in network byte order.
    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    /// Write bytes in front of the readable region.
    ///
    /// Requires `data.len() <= prependable_bytes()`; the prepend space is
    /// consumed permanently until the readable region is fully retrieved.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_idx -= data.len();
        let read_idx = self.read_idx;
        self.buf[read_idx..read_idx + data.len()].copy_from_slice(data);
    }

    /// Prepend a u32 in network byte order (the length-prefix case).
    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    /// Make sure at least `n` writable bytes exist.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        assert!(self.writable_bytes() >= n);
    }

    /// Drop excess capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut other = Buffer::with_capacity(readable + reserve);
        other.append(self.peek());
        *self = other;
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            // Not enough slack even after compaction: grow the allocation.
            self.buf.resize(self.write_idx + n, 0);
        } else {
            // Move readable data to the front to reclaim consumed space.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_idx..self.write_idx, CHEAP_PREPEND);
            self.read_idx = CHEAP_PREPEND;
            self.write_idx = CHEAP_PREPEND + readable;
        }
    }

    /// Read from `fd` directly into the buffer with a scatter read.
    ///
    /// A 64 KiB stack buffer serves as the second iovec, so a read larger
    /// than the current writable space still completes in one syscall; the
    /// overflow is appended afterwards. Returns the byte count (0 = EOF).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.write_idx) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        // When there is already more headroom than the stack buffer, a
        // single iovec is enough.
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fresh_buffer_regions() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_append_retrieve_identity() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.append(b", ");
        buf.append(b"world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.retrieve_all_as_string(), "hello, world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_partial_retrieve_advances_read_index() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"cdef");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 2);
    }

    #[test]
    fn test_grow_when_appending_past_capacity() {
        let mut buf = Buffer::new();
        let big = vec![b'x'; INITIAL_SIZE + 500];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 500);
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn test_make_space_compacts_before_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(600);
        // 600 consumed + 224 writable is plenty for 700 more without growing.
        let len_before = buf.buf.len();
        buf.append(&vec![b'b'; 700]);
        assert_eq!(buf.buf.len(), len_before);
        assert_eq!(buf.readable_bytes(), 900);
        assert_eq!(&buf.peek()[..200], &vec![b'a'; 200][..]);
    }

    #[test]
    fn test_prepend_consumes_prepend_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_u32(7);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_u32(), 7);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    fn test_prepend_equals_fresh_construction() {
        let mut a = Buffer::new();
        a.append(b"body");
        a.prepend(b"head");

        let mut b = Buffer::new();
        b.append(b"head");
        b.append(b"body");

        assert_eq!(a.peek(), b.peek());
    }

    #[test]
    fn test_u32_roundtrip_network_order() {
        let mut buf = Buffer::new();
        buf.append_u32(0xdead_beef);
        assert_eq!(buf.peek(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(buf.peek_u32(), 0xdead_beef);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
    }

    #[test]
    fn test_shrink_drops_capacity() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 4096]);
        buf.retrieve(4000);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 96);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.peek(), &vec![b'x'; 96][..]);
    }

    #[test]
    fn test_read_fd_small_payload() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut write_end = unsafe {
            use std::os::fd::FromRawFd;
            std::fs::File::from_raw_fd(fds[1])
        };
        write_end.write_all(b"ping").unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.retrieve_all_as_string(), "ping");
        unsafe { libc::close(fds[0]) };
    }

    #[test]
    fn test_read_fd_overflows_into_extrabuf() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut write_end = unsafe {
            use std::os::fd::FromRawFd;
            std::fs::File::from_raw_fd(fds[1])
        };
        // More than the initial 1024 writable bytes, forcing the second iovec.
        let payload = vec![b'z'; 5000];
        write_end.write_all(&payload).unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 5000);
        assert_eq!(buf.peek(), &payload[..]);
        unsafe { libc::close(fds[0]) };
    }

    #[test]
    fn test_read_fd_eof_returns_zero() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };

        let mut buf = Buffer::new();
        assert_eq!(buf.read_fd(fds[0]).unwrap(), 0);
        unsafe { libc::close(fds[0]) };
    }
}
