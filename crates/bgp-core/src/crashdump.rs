use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

const RING_CAPACITY: usize = 100;

/// A single timestamped entry in a dumper's audit ring.
#[derive(Debug, Clone)]
pub struct DumpEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

/// Something a crash dump should be able to ask for a description of its
/// current state. Implemented by each long-lived route table.
pub trait CrashDumper {
    /// Human-readable summary of the table's current state, included
    /// verbatim in a crash dump. Default is empty, matching tables that
    /// don't need more than their audit ring.
    fn dump_state(&self) -> String {
        String::new()
    }
}

/// Bounded ring log shared by a `CrashDumper` implementation: push a message
/// per notable event, and it self-trims to the last 100.
pub struct AuditRing {
    entries: RefCell<VecDeque<DumpEntry>>,
}

impl AuditRing {
    pub fn new() -> Self {
        Self { entries: RefCell::new(VecDeque::with_capacity(RING_CAPACITY)) }
    }

    pub fn record(&self, message: impl Into<String>, now: chrono::DateTime<chrono::Utc>) {
        let mut entries = self.entries.borrow_mut();
        if entries.len() == RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(DumpEntry { timestamp: now, message: message.into() });
    }

    pub fn render(&self) -> String {
        self.entries
            .borrow()
            .iter()
            .map(|e| format!("{} {}", e.timestamp.to_rfc3339(), e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for AuditRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle-scoped registry of every live `CrashDumper`, created at startup
/// and owned by the speaker (not a process-wide static), per §9's guidance
/// that the attribute manager and crash-dump registration should both be
/// lifecycle-scoped services.
#[derive(Default)]
pub struct CrashDumpManager {
    dumpers: RefCell<Vec<Weak<dyn CrashDumper>>>,
}

impl CrashDumpManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn register(&self, dumper: &Rc<dyn CrashDumper>) {
        self.dumpers.borrow_mut().push(Rc::downgrade(dumper));
    }

    pub fn unregister(&self, dumper: &Rc<dyn CrashDumper>) {
        let target = Rc::as_ptr(dumper);
        self.dumpers.borrow_mut().retain(|w| {
            w.upgrade().map(|d| Rc::as_ptr(&d) != target).unwrap_or(false)
        });
    }

    /// Concatenates every registered dumper's state. The caller is
    /// responsible for writing the result to a file under the per-user temp
    /// directory; this type only collects the text.
    pub fn crash_dump(&self) -> String {
        self.dumpers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|d| d.dump_state())
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl CrashDumper for Dummy {
        fn dump_state(&self) -> String {
            "dummy".into()
        }
    }

    #[test]
    fn ring_trims_to_capacity() {
        let ring = AuditRing::new();
        let now = chrono::Utc::now();
        for i in 0..150 {
            ring.record(format!("event {i}"), now);
        }
        assert_eq!(ring.render().lines().count(), RING_CAPACITY);
    }

    #[test]
    fn manager_collects_registered_dumpers() {
        let mgr = CrashDumpManager::new();
        let dumper: Rc<dyn CrashDumper> = Rc::new(Dummy);
        mgr.register(&dumper);
        assert!(mgr.crash_dump().contains("dummy"));
        mgr.unregister(&dumper);
        assert!(mgr.crash_dump().is_empty());
    }
}
