//! Bounded in-memory byte rings backing per-service log storage.
//!
//! Each service owns one ring with a single writer (the service output
//! formatter) and any number of cursor-based readers. Offsets are monotonic
//! across the life of the ring, so a reader can detect being lapped by the
//! writer and resynchronize at the oldest retained byte.

use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Marker emitted once by an iterator that lost data to the writer.
pub const TRUNCATION_MARKER: &[u8] = b"(... output truncated ...)\n";

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct RingState {
    data: VecDeque<u8>,
    capacity: usize,
    /// Offset of the first retained byte.
    start: u64,
    /// Offset one past the last written byte.
    end: u64,
    closed: bool,
}

#[derive(Debug)]
struct RingInner {
    state: Mutex<RingState>,
    grown: Condvar,
}

/// Fixed-capacity byte ring with monotonic offsets.
///
/// Cloning produces another handle to the same ring; callers serialize
/// writes by keeping a single formatting writer per service.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    inner: Arc<RingInner>,
}

impl RingBuffer {
    /// Creates a ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RingInner {
                state: Mutex::new(RingState {
                    data: VecDeque::with_capacity(capacity.min(4096)),
                    capacity,
                    start: 0,
                    end: 0,
                    closed: false,
                }),
                grown: Condvar::new(),
            }),
        }
    }

    /// Appends bytes, evicting the oldest data in bulk when space runs out.
    pub fn append(&self, buf: &[u8]) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        if buf.len() >= state.capacity {
            // The write alone overflows the ring; keep only its tail.
            let keep = state.capacity;
            state.data.clear();
            state.data.extend(&buf[buf.len() - keep..]);
            state.end += buf.len() as u64;
            state.start = state.end - keep as u64;
        } else {
            let needed = state.data.len() + buf.len();
            if needed > state.capacity {
                let evict = needed - state.capacity;
                state.data.drain(..evict);
                state.start += evict as u64;
            }
            state.data.extend(buf);
            state.end += buf.len() as u64;
        }

        self.inner.grown.notify_all();
    }

    /// Marks the ring closed; readers drain what is buffered and then see EOF.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.inner.grown.notify_all();
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Opens a reader positioned `last` lines back from the tail, or at the
    /// tail itself when `last` is `None` (follow mode sees only new output).
    pub fn iterator(&self, last: Option<usize>) -> LogIterator {
        let state = self.lock();
        let offset = match last {
            Some(lines) => Self::offset_of_trailing_lines(&state, lines),
            None => state.end,
        };
        drop(state);
        LogIterator {
            inner: Arc::clone(&self.inner),
            offset,
            truncated: false,
        }
    }

    fn offset_of_trailing_lines(state: &RingState, lines: usize) -> u64 {
        if lines == 0 {
            return state.end;
        }

        // Walk backwards counting newline boundaries; a trailing newline does
        // not start a new line.
        let data = &state.data;
        let mut remaining = lines;
        let mut index = data.len();
        while index > 0 {
            let at = index - 1;
            if data[at] == b'\n' && index != data.len() {
                remaining -= 1;
                if remaining == 0 {
                    return state.start + index as u64;
                }
            }
            index -= 1;
        }
        state.start
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cursor over a [`RingBuffer`].
///
/// A lagging iterator that gets lapped by the writer is advanced to the
/// oldest retained byte; the loss is reported once through the truncation
/// marker prepended to the next [`LogIterator::write_to`].
#[derive(Debug)]
pub struct LogIterator {
    inner: Arc<RingInner>,
    offset: u64,
    truncated: bool,
}

impl LogIterator {
    /// Blocks until unread data is available, the ring is closed, or `cancel`
    /// becomes true. Returns `true` when there is data to read.
    pub fn next(&mut self, cancel: &AtomicBool) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if self.offset < state.start {
                self.offset = state.start;
                self.truncated = true;
            }
            if self.offset < state.end {
                return true;
            }
            if state.closed || cancel.load(Ordering::Relaxed) {
                return false;
            }
            let (guard, _) = self
                .inner
                .grown
                .wait_timeout(state, WAIT_POLL)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Streams all unread bytes up to the current write head into `w`.
    ///
    /// Bytes are staged outside the ring lock so a slow consumer cannot stall
    /// the service output writer.
    pub fn write_to(&mut self, w: &mut dyn Write) -> io::Result<usize> {
        let (staged, truncated) = {
            let state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.offset < state.start {
                self.offset = state.start;
                self.truncated = true;
            }
            let skip = (self.offset - state.start) as usize;
            let staged: Vec<u8> = state.data.iter().skip(skip).copied().collect();
            self.offset = state.end;
            let truncated = self.truncated;
            self.truncated = false;
            (staged, truncated)
        };

        let mut written = 0;
        if truncated {
            w.write_all(TRUNCATION_MARKER)?;
            written += TRUNCATION_MARKER.len();
        }
        w.write_all(&staged)?;
        written += staged.len();
        Ok(written)
    }

    /// Current read offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True when the writer lapped this reader since the last read.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn read_all(it: &mut LogIterator) -> Vec<u8> {
        let mut out = Vec::new();
        it.write_to(&mut out).expect("write_to");
        out
    }

    #[test]
    fn reader_sees_contiguous_writes() {
        let ring = RingBuffer::new(64);
        let mut it = ring.iterator(Some(usize::MAX));
        ring.append(b"first\n");
        ring.append(b"second\n");

        assert_eq!(read_all(&mut it), b"first\nsecond\n");
        assert!(!it.truncated());
    }

    #[test]
    fn lapped_reader_skips_forward_and_reports_once() {
        let ring = RingBuffer::new(8);
        let mut it = ring.iterator(Some(usize::MAX));
        ring.append(b"0123");
        ring.append(b"456789ab");

        let out = read_all(&mut it);
        let mut expected = TRUNCATION_MARKER.to_vec();
        expected.extend_from_slice(b"456789ab");
        assert_eq!(out, expected);

        // The gap is reported only once.
        ring.append(b"cd");
        assert_eq!(read_all(&mut it), b"cd");
    }

    #[test]
    fn oversized_write_keeps_only_tail() {
        let ring = RingBuffer::new(4);
        let mut it = ring.iterator(Some(usize::MAX));
        ring.append(b"abcdefgh");

        let out = read_all(&mut it);
        assert!(out.ends_with(b"efgh"));
    }

    #[test]
    fn tail_positioning_counts_lines() {
        let ring = RingBuffer::new(1024);
        ring.append(b"one\ntwo\nthree\n");

        let mut it = ring.iterator(Some(2));
        assert_eq!(read_all(&mut it), b"two\nthree\n");

        let mut all = ring.iterator(Some(10));
        assert_eq!(read_all(&mut all), b"one\ntwo\nthree\n");

        let mut none = ring.iterator(None);
        assert_eq!(read_all(&mut none), b"");
    }

    #[test]
    fn next_blocks_until_write_or_close() {
        let ring = RingBuffer::new(64);
        let mut it = ring.iterator(None);
        let cancel = AtomicBool::new(false);

        let writer = ring.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.append(b"late\n");
        });

        assert!(it.next(&cancel));
        assert_eq!(read_all(&mut it), b"late\n");
        handle.join().expect("join");

        ring.close();
        assert!(!it.next(&cancel));
    }

    #[test]
    fn cancelled_next_returns_false() {
        let ring = RingBuffer::new(64);
        let mut it = ring.iterator(None);
        let cancel = AtomicBool::new(true);
        assert!(!it.next(&cancel));
    }
}
