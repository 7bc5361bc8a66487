use ledger_store::Record;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

/// Handed out by [`DataStore::begin_fetch`]; identifies one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchApply {
    Applied,
    /// A newer fetch already replaced the list.
    Stale { applied: u64 },
    Closed,
}

#[derive(Debug)]
struct Inner {
    records: Vec<Record>,
    issued: u64,
    applied: u64,
    in_flight: usize,
    last_fetch_at: Option<Instant>,
    closed: bool,
}

/// The session's in-memory list, newest first.
///
/// Fetch results replace it wholesale, but only when their generation is newer than the
/// last applied one. Mutations patch it in place. After [`DataStore::close`] every
/// change is rejected.
#[derive(Debug)]
pub struct DataStore {
    inner: Mutex<Inner>,
    tx: watch::Sender<Vec<Record>>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                issued: 0,
                applied: 0,
                in_flight: 0,
                last_fetch_at: None,
                closed: false,
            }),
            tx,
        }
    }

    pub fn begin_fetch(&self) -> FetchTicket {
        let mut inner = self.inner.lock();
        inner.issued += 1;
        inner.in_flight += 1;
        FetchTicket {
            generation: inner.issued,
            started: Instant::now(),
        }
    }

    pub fn complete_fetch(&self, ticket: FetchTicket, rows: Vec<Record>) -> FetchApply {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.closed {
            return FetchApply::Closed;
        }
        if ticket.generation <= inner.applied {
            return FetchApply::Stale {
                applied: inner.applied,
            };
        }
        inner.applied = ticket.generation;
        inner.last_fetch_at = Some(Instant::now());
        inner.records = rows;
        self.publish(&inner);
        FetchApply::Applied
    }

    /// Releases the ticket without touching the list.
    pub fn fail_fetch(&self, _ticket: FetchTicket) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Puts a freshly created row at the front. A row with the same id is replaced instead.
    pub fn prepend(&self, record: Record) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if let Some(pos) = inner.records.iter().position(|r| r.id == record.id) {
            inner.records[pos] = record;
        } else {
            inner.records.insert(0, record);
        }
        self.publish(&inner);
        true
    }

    /// Replaces the row with the same id; unknown ids leave the list untouched.
    ///
    /// Write responses lack the joined `category_name`, so the current one is kept while
    /// the category reference is unchanged.
    pub fn replace(&self, mut record: Record) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let Some(pos) = inner.records.iter().position(|r| r.id == record.id) else {
            return false;
        };
        let current = &inner.records[pos];
        if record.category_name.is_none() && record.category_ref == current.category_ref {
            record.category_name = current.category_name.clone();
        }
        inner.records[pos] = record;
        self.publish(&inner);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let before = inner.records.len();
        inner.records.retain(|r| r.id != id);
        if inner.records.len() == before {
            return false;
        }
        self.publish(&inner);
        true
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.lock().records.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner.lock().in_flight > 0
    }

    pub fn last_fetch_at(&self) -> Option<Instant> {
        self.inner.lock().last_fetch_at
    }

    pub fn applied_generation(&self) -> u64 {
        self.inner.lock().applied
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Record>> {
        self.tx.subscribe()
    }

    fn publish(&self, inner: &Inner) {
        self.tx.send_replace(inner.records.clone());
    }
}
