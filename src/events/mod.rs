//! Bounded event store backing SSE resumability.
//!
//! Outgoing stream events are kept in a ring buffer keyed by generated
//! ids so a client reconnecting with `Last-Event-ID` can replay the
//! suffix it missed. The window is bounded: once `max_events` entries
//! exist, storing evicts the oldest. Ids older than the window are
//! treated as unknown and replay nothing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// A single server-sent event.
#[derive(Debug, Clone)]
pub struct Event {
    /// `<unix_seconds>-<monotonic_seq>-<8_hex_chars>`
    pub id: String,
    pub event_type: Option<String>,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Render as an SSE frame: `id:` line, optional `event:` line,
    /// `data:` line, trailing blank line.
    pub fn to_sse(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 64);
        out.push_str("id: ");
        out.push_str(&self.id);
        out.push('\n');

        if let Some(event_type) = &self.event_type {
            out.push_str("event: ");
            out.push_str(event_type);
            out.push('\n');
        }

        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }

        out.push('\n');
        out
    }
}

/// Point-in-time counters for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStoreStats {
    pub stored: usize,
    pub capacity: usize,
    pub total_stored: u64,
    pub oldest_id: Option<String>,
    pub newest_id: Option<String>,
}

struct StoreInner {
    /// Buffered events, oldest first.
    events: VecDeque<Event>,
    /// id -> absolute position (total events stored before it).
    index: HashMap<String, u64>,
    /// Absolute position of the front of `events`.
    head: u64,
    /// Total events ever stored; also the next absolute position.
    total: u64,
    /// Monotonic sequence for id generation. Never reset while the
    /// store is live, including across `clear`.
    seq: u64,
}

/// Ring buffer of outgoing SSE events with id-keyed replay.
///
/// All operations take the inner mutex, so readers observe a snapshot
/// that was a contiguous suffix at some point in time.
pub struct EventStore {
    inner: Mutex<StoreInner>,
    max_events: usize,
}

impl EventStore {
    pub fn new(max_events: usize) -> Self {
        assert!(max_events > 0, "event store capacity must be nonzero");
        Self {
            inner: Mutex::new(StoreInner {
                events: VecDeque::with_capacity(max_events),
                index: HashMap::new(),
                head: 0,
                total: 0,
                seq: 0,
            }),
            max_events,
        }
    }

    /// Store an event and return its generated id.
    pub fn store(&self, data: impl Into<String>, event_type: Option<String>) -> String {
        let mut inner = self.inner.lock();
        let id = Self::make_id(&mut inner.seq);

        let event = Event {
            id: id.clone(),
            event_type,
            data: data.into(),
            timestamp: Utc::now(),
        };

        if inner.events.len() == self.max_events {
            if let Some(evicted) = inner.events.pop_front() {
                inner.index.remove(&evicted.id);
                inner.head += 1;
            }
        }

        let position = inner.total;
        inner.index.insert(id.clone(), position);
        inner.events.push_back(event);
        inner.total += 1;

        id
    }

    /// Events strictly after `last_id`, in insertion order.
    ///
    /// `None` returns the whole buffer. An unknown (or evicted) id is
    /// past the window and returns an empty vec, as does the newest id.
    pub fn get_after(&self, last_id: Option<&str>) -> Vec<Event> {
        let inner = self.inner.lock();

        match last_id {
            None => inner.events.iter().cloned().collect(),
            Some(id) => match inner.index.get(id) {
                Some(&position) => {
                    let skip = (position + 1 - inner.head) as usize;
                    inner.events.iter().skip(skip).cloned().collect()
                },
                None => Vec::new(),
            },
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    pub fn stats(&self) -> EventStoreStats {
        let inner = self.inner.lock();
        EventStoreStats {
            stored: inner.events.len(),
            capacity: self.max_events,
            total_stored: inner.total,
            oldest_id: inner.events.front().map(|e| e.id.clone()),
            newest_id: inner.events.back().map(|e| e.id.clone()),
        }
    }

    /// Drop all buffered events. The sequence counter keeps running so
    /// ids stay unique for the life of the store.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.head = inner.total;
        inner.events.clear();
        inner.index.clear();
    }

    fn make_id(seq: &mut u64) -> String {
        *seq += 1;
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{}-{:08x}", Utc::now().timestamp(), seq, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_none_returns_all() {
        let store = EventStore::new(16);
        let ids: Vec<String> = (0..4).map(|i| store.store(format!("e{}", i), None)).collect();

        let events = store.get_after(None);
        assert_eq!(events.len(), 4);
        for (event, id) in events.iter().zip(&ids) {
            assert_eq!(&event.id, id);
        }
    }

    #[test]
    fn test_get_after_returns_strict_suffix() {
        let store = EventStore::new(16);
        let ids: Vec<String> = (0..5).map(|i| store.store(format!("e{}", i), None)).collect();

        let suffix = store.get_after(Some(&ids[1]));
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix[0].id, ids[2]);
        assert_eq!(suffix[2].id, ids[4]);

        assert!(store.get_after(Some(&ids[4])).is_empty(), "newest id");
        assert!(store.get_after(Some("nope")).is_empty(), "unknown id");
    }

    #[test]
    fn test_eviction_keeps_suffix_well_defined() {
        // max_events=3, store e1..e5: window is [e3,e4,e5].
        let store = EventStore::new(3);
        let ids: Vec<String> = (1..=5).map(|i| store.store(format!("e{}", i), None)).collect();

        let all = store.get_after(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data, "e3");
        assert_eq!(all[2].data, "e5");

        assert!(!store.exists(&ids[0]));
        // e2 was evicted; an evicted id is unknown and replays nothing.
        assert!(store.get_after(Some(&ids[1])).is_empty());
        // A live id still replays correctly after eviction shifted the head.
        let after_e3 = store.get_after(Some(&ids[2]));
        assert_eq!(after_e3.len(), 2);
        assert_eq!(after_e3[0].data, "e4");
    }

    #[test]
    fn test_clear_preserves_sequence() {
        let store = EventStore::new(8);
        let before = store.store("a", None);
        store.clear();

        assert!(store.get_after(None).is_empty());
        assert!(!store.exists(&before));

        let after = store.store("b", None);
        let seq_of = |id: &str| -> u64 { id.split('-').nth(1).unwrap().parse().unwrap() };
        assert!(seq_of(&after) > seq_of(&before), "sequence never resets");
    }

    #[test]
    fn test_sse_rendering() {
        let event = Event {
            id: "1700000000-1-0000abcd".to_string(),
            event_type: Some("message".to_string()),
            data: "{\"x\":1}".to_string(),
            timestamp: Utc::now(),
        };

        assert_eq!(
            event.to_sse(),
            "id: 1700000000-1-0000abcd\nevent: message\ndata: {\"x\":1}\n\n"
        );

        let bare = Event {
            id: "1-2-00000000".to_string(),
            event_type: None,
            data: "two\nlines".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(bare.to_sse(), "id: 1-2-00000000\ndata: two\ndata: lines\n\n");
    }

    #[test]
    fn test_stats() {
        let store = EventStore::new(2);
        assert_eq!(store.stats().stored, 0);

        store.store("a", None);
        store.store("b", None);
        store.store("c", None);

        let stats = store.stats();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.total_stored, 3);
    }

    #[test]
    fn test_concurrent_store_and_read() {
        use std::sync::Arc;

        let store = Arc::new(EventStore::new(64));
        let mut handles = Vec::new();

        for t in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    store.store(format!("{}-{}", t, i), None);
                    let _ = store.get_after(None);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.stored, 64);
        assert_eq!(stats.total_stored, 400);
    }
}
