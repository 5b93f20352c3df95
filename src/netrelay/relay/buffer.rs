use std::collections::VecDeque;
use std::io::{self, Read, Write};

pub const TCP_BUFFER_SIZE: usize = 1460;
pub const UDP_BUFFER_SIZE: usize = 1472;

/// Fixed-capacity byte buffer for one direction of a TCP pair.
///
/// Bytes live in `data[start..end]`. Reads append at `end`, writes consume
/// from `start`; the window is compacted only when the tail is exhausted.
#[derive(Debug)]
pub struct RelayBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RelayBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0u8; cap].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Append as much of `bytes` as fits. Returns the number copied.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        if self.end + bytes.len() > self.data.len() {
            self.compact();
        }
        let n = bytes.len().min(self.data.len() - self.end);
        self.data[self.end..self.end + n].copy_from_slice(&bytes[..n]);
        self.end += n;
        n
    }

    /// One `read` call into the free tail. Callers check `is_full` first,
    /// since a zero-length read is indistinguishable from EOF.
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        if self.end == self.data.len() {
            self.compact();
        }
        let n = r.read(&mut self.data[self.end..])?;
        self.end += n;
        Ok(n)
    }

    /// One `write` call from the buffered bytes.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = w.write(&self.data[self.start..self.end])?;
        self.start += n;
        if self.start == self.end {
            self.clear();
        }
        Ok(n)
    }
}

/// Datagrams waiting for a writable socket, bounded by total bytes.
/// When full, the oldest datagrams are dropped first.
#[derive(Debug)]
pub struct PendingDatagrams {
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: usize,
    dropped: u64,
}

impl PendingDatagrams {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            bytes: 0,
            limit,
            dropped: 0,
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue a datagram. Returns how many older datagrams were evicted.
    pub fn push(&mut self, datagram: Vec<u8>) -> usize {
        if datagram.len() > self.limit {
            self.dropped += 1;
            return 1;
        }
        let mut evicted = 0;
        while self.bytes + datagram.len() > self.limit {
            match self.queue.pop_front() {
                Some(old) => {
                    self.bytes -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        self.dropped += evicted as u64;
        self.bytes += datagram.len();
        self.queue.push_back(datagram);
        evicted
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.queue.front().map(Vec::as_slice)
    }

    pub fn pop_front(&mut self) {
        if let Some(d) = self.queue.pop_front() {
            self.bytes -= d.len();
        }
    }
}
