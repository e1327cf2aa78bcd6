//! Service log formatting, tailing and forwarding.
//!
//! Service output is timestamped line by line into the per-service ring
//! buffer. Readers either collect a bounded tail merged across services by
//! timestamp, or follow live output with one forwarding thread per service
//! serialized through a shared writer mutex so lines do not interleave.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    engine::Manager,
    error::DaemonError,
    plan::{LogTargetType, Plan},
    ringbuf::{LogIterator, RingBuffer},
};

/// Timestamping writer feeding a service's ring buffer.
#[derive(Clone)]
pub struct OutputWriter {
    name: Arc<str>,
    ring: RingBuffer,
}

impl OutputWriter {
    /// Creates a writer labelling lines with the service name.
    pub fn new(name: &str, ring: RingBuffer) -> OutputWriter {
        OutputWriter {
            name: Arc::from(name),
            ring,
        }
    }

    /// Appends one output line, prefixed with timestamp and service name.
    pub fn write_line(&self, line: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let formatted = format!("{stamp} [{}] {line}\n", self.name);
        self.ring.append(formatted.as_bytes());
    }
}

/// One parsed log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Time the line was captured.
    pub time: DateTime<Utc>,
    /// Originating service.
    pub service: String,
    /// The line itself, without framing.
    pub message: String,
}

/// Parses a formatted ring-buffer line back into an entry.
pub fn parse_entry(raw: &str) -> Option<LogEntry> {
    let (stamp, rest) = raw.split_once(' ')?;
    let time = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
    let rest = rest.strip_prefix('[')?;
    let (service, message) = rest.split_once("] ").or_else(|| {
        rest.strip_suffix(']').map(|service| (service, ""))
    })?;
    Some(LogEntry {
        time,
        service: service.to_string(),
        message: message.to_string(),
    })
}

/// Drains each iterator and merges the parsed entries by timestamp,
/// keeping only the `last` most recent overall.
pub fn collect_tail(
    iterators: &mut [(String, LogIterator)],
    last: usize,
) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for (service, iterator) in iterators.iter_mut() {
        let mut buf = Vec::new();
        if iterator.write_to(&mut buf).is_err() {
            continue;
        }
        for line in String::from_utf8_lossy(&buf).lines() {
            match parse_entry(line) {
                Some(entry) => entries.push(entry),
                None => debug!("Skipping unparsable log line from \"{service}\""),
            }
        }
    }

    entries.sort_by_key(|entry| entry.time);
    if entries.len() > last {
        entries.drain(..entries.len() - last);
    }
    entries
}

/// Follows several iterators concurrently, writing whole bursts to `out`
/// under a shared mutex. Returns the forwarding threads; flip `cancel` to
/// stop them.
pub fn follow<W: Write + Send + 'static>(
    iterators: Vec<(String, LogIterator)>,
    out: Arc<Mutex<W>>,
    cancel: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    iterators
        .into_iter()
        .map(|(service, mut iterator)| {
            let out = Arc::clone(&out);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                while iterator.next(&cancel) {
                    let mut sink = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err(err) = iterator.write_to(&mut *sink) {
                        debug!("Log follower for \"{service}\" stopped: {err}");
                        cancel.store(true, Ordering::Relaxed);
                        return;
                    }
                    if sink.flush().is_err() {
                        cancel.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            })
        })
        .collect()
}

/// Looks up the live ring buffer for a service, if one exists yet.
pub type RingLookup = Arc<dyn Fn(&str) -> Option<RingBuffer> + Send + Sync>;

struct ForwardWorker {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Subscribes to service ring buffers and forwards lines to plan-configured
/// sinks.
pub struct LogManager {
    lookup: RingLookup,
    plan: Mutex<Arc<Plan>>,
    workers: Mutex<HashMap<String, ForwardWorker>>,
}

impl LogManager {
    /// Creates a manager resolving ring buffers through `lookup`.
    pub fn new(lookup: RingLookup) -> Arc<LogManager> {
        Arc::new(LogManager {
            lookup,
            plan: Mutex::new(Arc::new(Plan::default())),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Adopts a new plan and re-syncs forwarding workers.
    pub fn plan_changed(&self, plan: &Plan) {
        *self
            .plan
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(plan.clone());
        self.sync();
    }

    /// Starts workers for newly matching (target, service) pairs and stops
    /// ones no longer in the plan. Services whose ring buffer does not exist
    /// yet are picked up on a later sync.
    pub fn sync(&self) {
        let plan = Arc::clone(
            &self
                .plan
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut wanted: HashMap<String, (String, String)> = HashMap::new();
        for (target_name, target) in &plan.log_targets {
            if target.target_type != LogTargetType::File {
                continue;
            }
            for service in plan.services.keys() {
                if target.selects(service) {
                    wanted.insert(
                        format!("{target_name}\u{0}{service}"),
                        (target.location.clone(), service.clone()),
                    );
                }
            }
        }

        // Stop stale workers.
        let stale: Vec<String> = workers
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(worker) = workers.remove(&key) {
                worker.cancel.store(true, Ordering::Relaxed);
                let _ = worker.handle.join();
            }
        }

        // Start missing ones.
        for (key, (location, service)) in wanted {
            if workers.contains_key(&key) {
                continue;
            }
            let Some(ring) = (self.lookup)(&service) else {
                continue;
            };
            match spawn_file_forwarder(&service, &location, ring) {
                Some(worker) => {
                    workers.insert(key, worker);
                }
                None => warn!("Cannot forward \"{service}\" logs to {location}"),
            }
        }
    }

    /// Stops every forwarding worker.
    pub fn stop(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, worker) in workers.drain() {
            worker.cancel.store(true, Ordering::Relaxed);
            let _ = worker.handle.join();
        }
    }
}

impl Manager for LogManager {
    fn name(&self) -> &'static str {
        "log-manager"
    }

    fn ensure(&self) -> Result<(), DaemonError> {
        self.sync();
        Ok(())
    }
}

fn spawn_file_forwarder(
    service: &str,
    location: &str,
    ring: RingBuffer,
) -> Option<ForwardWorker> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(location)
        .ok()?;

    let cancel = Arc::new(AtomicBool::new(false));
    let mut iterator = ring.iterator(None);
    let worker_cancel = Arc::clone(&cancel);
    let label = service.to_string();
    let handle = thread::spawn(move || {
        let mut file = file;
        while iterator.next(&worker_cancel) {
            if let Err(err) = iterator.write_to(&mut file) {
                warn!("Forwarding \"{label}\" logs failed: {err}");
                return;
            }
        }
    });

    Some(ForwardWorker { cancel, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formatted_lines_round_trip() {
        let ring = RingBuffer::new(4096);
        let writer = OutputWriter::new("web", ring.clone());
        writer.write_line("listening on :8080");

        let mut it = ring.iterator(Some(10));
        let mut buf = Vec::new();
        it.write_to(&mut buf).unwrap();
        let raw = String::from_utf8(buf).unwrap();
        let entry = parse_entry(raw.trim_end()).expect("parse");
        assert_eq!(entry.service, "web");
        assert_eq!(entry.message, "listening on :8080");
    }

    #[test]
    fn tail_merges_by_timestamp() {
        let ring_a = RingBuffer::new(4096);
        let ring_b = RingBuffer::new(4096);
        let writer_a = OutputWriter::new("a", ring_a.clone());
        let writer_b = OutputWriter::new("b", ring_b.clone());

        writer_a.write_line("first");
        thread::sleep(Duration::from_millis(5));
        writer_b.write_line("second");
        thread::sleep(Duration::from_millis(5));
        writer_a.write_line("third");

        let mut iterators = vec![
            ("a".to_string(), ring_a.iterator(Some(10))),
            ("b".to_string(), ring_b.iterator(Some(10))),
        ];
        let entries = collect_tail(&mut iterators, 10);
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);

        let mut iterators = vec![
            ("a".to_string(), ring_a.iterator(Some(10))),
            ("b".to_string(), ring_b.iterator(Some(10))),
        ];
        let entries = collect_tail(&mut iterators, 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
    }

    #[test]
    fn follow_streams_new_lines() {
        let ring = RingBuffer::new(4096);
        let writer = OutputWriter::new("svc", ring.clone());

        let out = Arc::new(Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let handles = follow(
            vec![("svc".to_string(), ring.iterator(None))],
            Arc::clone(&out),
            Arc::clone(&cancel),
        );

        writer.write_line("live line");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let buf = out.lock().unwrap();
                if String::from_utf8_lossy(&buf).contains("live line") {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "line never arrived");
            thread::sleep(Duration::from_millis(10));
        }

        cancel.store(true, Ordering::Relaxed);
        ring.close();
        for handle in handles {
            let _ = handle.join();
        }
    }
}
