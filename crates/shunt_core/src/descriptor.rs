//! Descriptors: the per-worker wrapper around one network endpoint.
//!
//! A descriptor owns a nonblocking socket plus its read/write queues and
//! is referenced through a {index, generation} slot key. The worker's
//! token map is the single source of truth for which handler an event
//! token dispatches into; a freed slot makes stale events fail the
//! lookup instead of reaching a dead handler.

use std::io::{Read, Write};
use std::time::Instant;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use shunt_common::buffer::{ReadQueue, WriteQueue};
use shunt_common::types::{SessionId, TargetId};

/// Read chunk size for one `read()` call.
const READ_CHUNK: usize = 16 * 1024;

/// Token index 0 is the worker's wakeup fd, 1 the shared listener set.
/// Descriptor slots start above these.
pub const WAKER_TOKEN: Token = Token(0);
pub const LISTENER_TOKEN: Token = Token(1);
const FIRST_SLOT: usize = 2;

/// What a readiness event on a token dispatches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Client descriptor of a session.
    Client(SessionId),
    /// Backend descriptor linked to a session, keyed by target.
    Backend(SessionId, TargetId),
    /// Idle pooled backend: any traffic evicts and closes it.
    Pooled(TargetId),
}

/// Role tag of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Backend,
}

/// Slot key: index plus generation. A key whose generation no longer
/// matches its slot is dangling and fails lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescKey {
    pub index: usize,
    pub generation: u32,
}

impl DescKey {
    pub fn token(&self) -> Token {
        Token(self.index)
    }
}

struct Slot {
    generation: u32,
    attachment: Option<Attachment>,
}

/// Per-worker arena mapping event tokens to handler attachments.
pub struct TokenMap {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    total_inserted: u64,
}

impl TokenMap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            total_inserted: 0,
        }
    }

    /// Claim a slot for a new descriptor.
    pub fn insert(&mut self, attachment: Attachment) -> DescKey {
        self.live += 1;
        self.total_inserted += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index - FIRST_SLOT];
            slot.attachment = Some(attachment);
            DescKey {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                attachment: Some(attachment),
            });
            DescKey {
                index: FIRST_SLOT + self.slots.len() - 1,
                generation: 0,
            }
        }
    }

    /// Current attachment for a raw token index, if the slot is live.
    pub fn attachment(&self, index: usize) -> Option<Attachment> {
        if index < FIRST_SLOT {
            return None;
        }
        self.slots.get(index - FIRST_SLOT)?.attachment
    }

    /// Rebind a live slot to a new attachment (e.g. pooled ⇄ linked).
    /// Fails on a dangling key.
    pub fn rebind(&mut self, key: DescKey, attachment: Attachment) -> bool {
        match self.slots.get_mut(key.index - FIRST_SLOT) {
            Some(slot) if slot.generation == key.generation && slot.attachment.is_some() => {
                slot.attachment = Some(attachment);
                true
            }
            _ => false,
        }
    }

    /// Release a slot. The generation bump invalidates outstanding keys.
    pub fn remove(&mut self, key: DescKey) -> Option<Attachment> {
        let slot = self.slots.get_mut(key.index - FIRST_SLOT)?;
        if slot.generation != key.generation {
            return None;
        }
        let attachment = slot.attachment.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(attachment)
    }

    /// Number of live descriptor slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total descriptors ever registered on this worker.
    pub fn total_inserted(&self) -> u64 {
        self.total_inserted
    }
}

impl Default for TokenMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of draining a socket's readable data.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
}

/// One network endpoint owned by a worker: socket, buffers, timestamps.
pub struct Descriptor {
    pub key: DescKey,
    pub role: Role,
    stream: TcpStream,
    pub read_q: ReadQueue,
    pub write_q: WriteQueue,
    pub last_read: Instant,
    pub last_write: Instant,
    pub hung_up: bool,
    want_write: bool,
    registered: bool,
}

impl Descriptor {
    pub fn new(stream: TcpStream, role: Role, key: DescKey) -> Self {
        let now = Instant::now();
        Self {
            key,
            role,
            stream,
            read_q: ReadQueue::new(),
            write_q: WriteQueue::new(),
            last_read: now,
            last_write: now,
            hung_up: false,
            want_write: false,
            registered: false,
        }
    }

    /// Add the descriptor to a worker's readiness set (edge-triggered).
    pub fn register(&mut self, registry: &Registry) -> std::io::Result<()> {
        registry.register(&mut self.stream, self.key.token(), Interest::READABLE)?;
        self.registered = true;
        Ok(())
    }

    /// Remove the descriptor from the readiness set. Idempotent.
    pub fn deregister(&mut self, registry: &Registry) {
        if self.registered {
            let _ = registry.deregister(&mut self.stream);
            self.registered = false;
        }
    }

    /// Re-register under a new key, e.g. after a session migration moved
    /// the descriptor to another worker's readiness set.
    pub fn rekey(&mut self, registry: &Registry, key: DescKey) -> std::io::Result<()> {
        self.key = key;
        let interest = if self.want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.register(&mut self.stream, key.token(), interest)?;
        self.registered = true;
        Ok(())
    }

    /// Drain all readable bytes into the read queue (edge-triggered
    /// sockets deliver one wakeup for everything buffered).
    pub fn fill_read_queue(&mut self) -> std::io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.hung_up = true;
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    outcome.bytes += n;
                    self.read_q.push(Bytes::copy_from_slice(&chunk[..n]));
                    self.last_read = Instant::now();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Queue bytes for the peer and try to flush immediately.
    pub fn enqueue_write(&mut self, bytes: Bytes, registry: &Registry) -> std::io::Result<()> {
        self.write_q.push(bytes);
        self.flush(registry)?;
        Ok(())
    }

    /// Drain the pending-write buffer. A partial drain re-arms writable
    /// interest; a full drain drops it. Returns true when fully drained.
    pub fn flush(&mut self, registry: &Registry) -> std::io::Result<bool> {
        while let Some(front) = self.write_q.front() {
            match self.stream.write(front) {
                Ok(0) => {
                    self.hung_up = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.write_q.advance(n);
                    self.last_write = Instant::now();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let drained = self.write_q.is_empty();
        if drained && self.want_write {
            self.want_write = false;
            if self.registered {
                registry.reregister(&mut self.stream, self.key.token(), Interest::READABLE)?;
            }
        } else if !drained && !self.want_write {
            self.want_write = true;
            if self.registered {
                registry.reregister(
                    &mut self.stream,
                    self.key.token(),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
        }
        Ok(drained)
    }

    /// Seconds since the last read or write on this descriptor.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_read.max(self.last_write))
    }

    /// Approximate heap footprint of the buffered data.
    pub fn buffered_bytes(&self) -> usize {
        self.read_q.len() + self.write_q.len()
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_map_insert_remove() {
        let mut map = TokenMap::new();
        let k1 = map.insert(Attachment::Client(SessionId(1)));
        let k2 = map.insert(Attachment::Pooled(TargetId(0)));
        assert_eq!(k1.index, FIRST_SLOT);
        assert_eq!(k2.index, FIRST_SLOT + 1);
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove(k1), Some(Attachment::Client(SessionId(1))));
        assert_eq!(map.len(), 1);
        assert_eq!(map.attachment(k1.index), None);
    }

    #[test]
    fn test_token_map_generation_invalidates_stale_keys() {
        let mut map = TokenMap::new();
        let k1 = map.insert(Attachment::Client(SessionId(1)));
        map.remove(k1);
        let k2 = map.insert(Attachment::Client(SessionId(2)));
        // Slot reused, generation bumped.
        assert_eq!(k1.index, k2.index);
        assert_ne!(k1.generation, k2.generation);
        assert_eq!(map.remove(k1), None, "stale key must not free the slot");
        assert_eq!(map.remove(k2), Some(Attachment::Client(SessionId(2))));
    }

    #[test]
    fn test_token_map_rebind() {
        let mut map = TokenMap::new();
        let k = map.insert(Attachment::Backend(SessionId(1), TargetId(0)));
        assert!(map.rebind(k, Attachment::Pooled(TargetId(0))));
        assert_eq!(map.attachment(k.index), Some(Attachment::Pooled(TargetId(0))));

        let stale = DescKey {
            index: k.index,
            generation: k.generation + 1,
        };
        assert!(!map.rebind(stale, Attachment::Client(SessionId(9))));
    }

    #[test]
    fn test_reserved_tokens_never_resolve() {
        let map = TokenMap::new();
        assert_eq!(map.attachment(WAKER_TOKEN.0), None);
        assert_eq!(map.attachment(LISTENER_TOKEN.0), None);
    }

    #[test]
    fn test_total_inserted_is_monotonic() {
        let mut map = TokenMap::new();
        let k = map.insert(Attachment::Client(SessionId(1)));
        map.remove(k);
        map.insert(Attachment::Client(SessionId(2)));
        assert_eq!(map.total_inserted(), 2);
        assert_eq!(map.len(), 1);
    }
}
