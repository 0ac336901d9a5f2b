use std::io;

// Growth and compaction granularity.
const BUF_SIZE_INCREMENT: usize = 65536;

/// Outcome of draining a non-blocking reader into the buffer.
#[derive(Debug, Eq, PartialEq)]
pub enum Ingress {
    /// The reader has no more data for now; `0` bytes arrived is valid.
    Drained(usize),
    /// The reader reached end-of-stream after delivering the given bytes.
    Closed(usize),
}

/// A byte FIFO sitting between the socket and the parsers. Data is appended
/// at the tail and consumed from the head; consumed space is reclaimed in
/// `BUF_SIZE_INCREMENT` steps so the unread region stays a single slice.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::with_capacity(BUF_SIZE_INCREMENT),
            head: 0,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer has no unread bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// Slice containing the unread bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Appends bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `count` bytes as consumed, advancing the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len(), "consumed past the buffer tail");
        self.head += count;
        self.maybe_compact();
    }

    /// Drops all buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Reads from the supplied non-blocking reader until it would block or
    /// reaches end-of-stream, appending everything at the tail.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<Ingress> {
        let mut total = 0;

        loop {
            let write_from = self.data.len();
            self.data.resize(write_from + BUF_SIZE_INCREMENT, 0);

            match reader.read(&mut self.data[write_from..]) {
                Ok(0) => {
                    self.data.truncate(write_from);
                    return Ok(Ingress::Closed(total));
                }
                Ok(count) => {
                    self.data.truncate(write_from + count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.data.truncate(write_from);
                    return Ok(Ingress::Drained(total));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.data.truncate(write_from);
                }
                Err(err) => {
                    self.data.truncate(write_from);
                    return Err(err);
                }
            }
        }
    }

    /// Writes the unread bytes to the supplied non-blocking writer, stopping
    /// when the writer would block. Returns the number of bytes written; the
    /// remainder stays buffered.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while self.head < self.data.len() {
            match writer.write(&self.data[self.head..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.head += count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        self.maybe_compact();
        Ok(total)
    }

    #[inline]
    fn maybe_compact(&mut self) {
        if self.head >= BUF_SIZE_INCREMENT {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
