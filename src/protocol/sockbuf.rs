//! Byte queues backing the send and receive sides of a connection.

use std::collections::VecDeque;

use crate::error::{Result, ValidationError};

/// Identifies a group of chunks appended as "not ready" by one send.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(pub u64);

#[derive(Debug)]
struct Chunk {
    data: Vec<u8>,
    /// Pending external completion while set.
    ticket: Option<Ticket>,
}

/// Chunked byte queue with a high-water budget.
///
/// Chunks appended as not ready occupy buffer space but cannot be taken for
/// transmission until completed through [`SockBuf::ready`].
#[derive(Debug)]
pub struct SockBuf {
    hiwat: usize,
    chunks: VecDeque<Chunk>,
    len: usize,
    not_ready: usize,
    next_ticket: u64,
}

impl SockBuf {
    /// Creates an empty buffer with the given budget.
    pub fn new(hiwat: usize) -> Self {
        Self {
            hiwat,
            chunks: VecDeque::new(),
            len: 0,
            not_ready: 0,
            next_ticket: 1,
        }
    }

    /// Buffer budget in bytes.
    pub fn hiwat(&self) -> usize {
        self.hiwat
    }

    /// Total number of queued bytes, ready or not.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of queued bytes available for transmission or reading.
    pub fn ready_len(&self) -> usize {
        self.len - self.not_ready
    }

    /// Remaining budget. Goes negative once urgent data overcommits the
    /// buffer.
    pub fn space(&self) -> isize {
        self.hiwat as isize - self.len as isize
    }

    /// Appends `data` as ready.
    pub fn append(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }

        self.len += data.len();
        self.chunks.push_back(Chunk { data, ticket: None });
    }

    /// Appends `chunks` as not ready and returns the ticket that completes
    /// them.
    pub fn append_not_ready(&mut self, chunks: Vec<Vec<u8>>) -> Ticket {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        for data in chunks {
            self.len += data.len();
            self.not_ready += data.len();
            self.chunks.push_back(Chunk {
                data,
                ticket: Some(ticket),
            });
        }

        ticket
    }

    /// Marks up to `count` chunks of `ticket` as ready, returning the number
    /// of bytes that became available.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if no chunk is pending under `ticket`.
    pub fn ready(&mut self, ticket: Ticket, count: usize) -> Result<usize> {
        if !self.chunks.iter().any(|c| c.ticket == Some(ticket)) {
            return Err(ValidationError::UnknownTicket(ticket.0).into());
        }

        let mut nbytes = 0;

        for chunk in self
            .chunks
            .iter_mut()
            .filter(|c| c.ticket == Some(ticket))
            .take(count)
        {
            chunk.ticket = None;
            nbytes += chunk.data.len();
        }

        self.not_ready -= nbytes;
        Ok(nbytes)
    }

    /// Frees up to `count` pending chunks of `ticket` without completing
    /// them, returning the number freed.
    pub fn discard(&mut self, ticket: Ticket, count: usize) -> usize {
        let mut freed = 0;

        self.chunks.retain(|c| {
            if freed < count && c.ticket == Some(ticket) {
                freed += 1;
                self.len -= c.data.len();
                self.not_ready -= c.data.len();
                false
            } else {
                true
            }
        });

        freed
    }

    /// Removes up to `max` ready bytes from the front of the queue. Stops at
    /// the first chunk that is not ready.
    pub fn drain(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();

        while out.len() < max {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            if chunk.ticket.is_some() {
                break;
            }

            let want = max - out.len();

            if chunk.data.len() <= want {
                out.extend_from_slice(&chunk.data);
                self.chunks.pop_front();
            } else {
                out.extend(chunk.data.drain(..want));
            }
        }

        self.len -= out.len();
        out
    }

    /// Drops every queued byte.
    pub fn flush(&mut self) {
        self.chunks.clear();
        self.len = 0;
        self.not_ready = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockbuf_space_goes_negative_valid() {
        let mut buf = SockBuf::new(4);

        buf.append(b"abc".to_vec());
        assert_eq!(buf.space(), 1);

        buf.append(b"defg".to_vec());
        assert_eq!(buf.space(), -3);
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn sockbuf_drain_splits_chunks_valid() {
        let mut buf = SockBuf::new(64);
        buf.append(b"hello".to_vec());
        buf.append(b"world".to_vec());

        assert_eq!(buf.drain(7), b"hellowo");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.drain(usize::MAX), b"rld");
        assert!(buf.is_empty());
    }

    #[test]
    fn sockbuf_not_ready_blocks_drain_valid() {
        let mut buf = SockBuf::new(64);
        buf.append(b"ab".to_vec());
        let ticket = buf.append_not_ready(vec![b"cd".to_vec(), b"ef".to_vec()]);
        buf.append(b"gh".to_vec());

        assert_eq!(buf.ready_len(), 4);
        assert_eq!(buf.drain(usize::MAX), b"ab");

        assert_eq!(buf.ready(ticket, 1).unwrap(), 2);
        assert_eq!(buf.drain(usize::MAX), b"cd");

        assert_eq!(buf.ready(ticket, 1).unwrap(), 2);
        assert_eq!(buf.drain(usize::MAX), b"efgh");
        assert!(buf.is_empty());
    }

    #[test]
    fn sockbuf_unknown_ticket_invalid() {
        let mut buf = SockBuf::new(64);
        buf.append(b"ab".to_vec());

        let err = buf.ready(Ticket(9), 1).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn sockbuf_discard_pending_valid() {
        let mut buf = SockBuf::new(64);
        let ticket = buf.append_not_ready(vec![b"abc".to_vec(), b"de".to_vec()]);

        assert_eq!(buf.discard(ticket, 5), 2);
        assert!(buf.is_empty());
        assert_eq!(buf.ready_len(), 0);
    }
}
