use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use ulid::Ulid;

use crate::journal::{self, Journal, JournalCommand};
use crate::limits::MAX_DURATION_MS;
use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A blocking booking of the same owner already overlaps.
    Exclusion { owner: OwnerKind, conflicting: Ulid },
    /// The row's status changed since the caller read it.
    StaleWrite(Ulid),
    Journal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Exclusion { owner, conflicting } => write!(
                f,
                "{} already holds overlapping booking {conflicting}",
                owner.as_str()
            ),
            StoreError::StaleWrite(id) => write!(f, "booking {id} was modified concurrently"),
            StoreError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The authoritative booking store. Every write is one transaction: the booking row and
/// its status-history row land together or not at all.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert_booking(
        &self,
        booking: Booking,
        entry: StatusHistoryEntry,
    ) -> Result<(), StoreError>;

    /// Compare-and-set on status: fails with `StaleWrite` unless the stored status is `expected`.
    async fn update_booking(
        &self,
        booking: Booking,
        expected: BookingStatus,
        entry: StatusHistoryEntry,
    ) -> Result<(), StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Blocking bookings of one owner overlapping `span`, optionally ignoring one booking.
    async fn blocking_overlaps(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError>;

    /// All bookings of one owner (any status) overlapping `span`, ordered by start.
    async fn bookings_for_owner(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn status_history(&self, booking_id: Ulid) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn working_hours(&self, expert_id: Ulid) -> Result<Vec<WorkingHourRule>, StoreError>;

    async fn replace_working_hours(
        &self,
        expert_id: Ulid,
        rules: Vec<WorkingHourRule>,
    ) -> Result<(), StoreError>;

    /// Windows whose first occurrence starts before `span.end`; callers expand recurrences.
    async fn unavailability(
        &self,
        expert_id: Ulid,
        span: Span,
    ) -> Result<Vec<UnavailabilityWindow>, StoreError>;

    async fn add_unavailability(&self, window: UnavailabilityWindow) -> Result<(), StoreError>;

    async fn remove_unavailability(&self, id: Ulid) -> Result<UnavailabilityWindow, StoreError>;
}

/// DashMap tables of the in-process store. Reads go straight here; writes are applied
/// only after their journal record is durable.
#[derive(Default)]
struct Tables {
    bookings: DashMap<Ulid, Booking>,
    history: DashMap<Ulid, Vec<StatusHistoryEntry>>,
    /// (owner kind, owner id) → `(start, booking id)` sorted by start.
    by_owner: DashMap<(OwnerKind, Ulid), Vec<(Ms, Ulid)>>,
    working_hours: DashMap<Ulid, Vec<WorkingHourRule>>,
    unavailability: DashMap<Ulid, Vec<UnavailabilityWindow>>,
    /// Reverse lookup: unavailability window id → expert id.
    window_owner: DashMap<Ulid, Ulid>,
}

impl Tables {
    fn apply(&self, record: &JournalRecord) {
        match record {
            JournalRecord::BookingInserted { booking, entry } => {
                self.index_owner(booking);
                self.bookings.insert(booking.id, booking.clone());
                self.history.entry(booking.id).or_default().push(entry.clone());
            }
            JournalRecord::BookingUpdated { booking, entry } => {
                let previous_start = self.bookings.get(&booking.id).map(|b| b.start);
                if let Some(old) = previous_start
                    && old != booking.start
                {
                    self.unindex_owner(booking, old);
                    self.index_owner(booking);
                }
                self.bookings.insert(booking.id, booking.clone());
                self.history.entry(booking.id).or_default().push(entry.clone());
            }
            JournalRecord::BookingRestored { booking, history } => {
                self.index_owner(booking);
                self.bookings.insert(booking.id, booking.clone());
                self.history.insert(booking.id, history.clone());
            }
            JournalRecord::WorkingHoursReplaced { expert_id, rules } => {
                self.working_hours.insert(*expert_id, rules.clone());
            }
            JournalRecord::UnavailabilityAdded { window } => {
                self.window_owner.insert(window.id, window.expert_id);
                self.unavailability
                    .entry(window.expert_id)
                    .or_default()
                    .push(window.clone());
            }
            JournalRecord::UnavailabilityRemoved { id, expert_id } => {
                self.window_owner.remove(id);
                if let Some(mut windows) = self.unavailability.get_mut(expert_id) {
                    windows.retain(|w| w.id != *id);
                }
            }
        }
    }

    fn index_owner(&self, booking: &Booking) {
        for kind in [OwnerKind::Expert, OwnerKind::User] {
            let mut list = self.by_owner.entry((kind, booking.owner_id(kind))).or_default();
            let key = (booking.start, booking.id);
            let pos = list.binary_search(&key).unwrap_or_else(|e| e);
            list.insert(pos, key);
        }
    }

    fn unindex_owner(&self, booking: &Booking, old_start: Ms) {
        for kind in [OwnerKind::Expert, OwnerKind::User] {
            if let Some(mut list) = self.by_owner.get_mut(&(kind, booking.owner_id(kind))) {
                list.retain(|&(start, id)| !(id == booking.id && start == old_start));
            }
        }
    }

    /// Ids of bookings that could overlap `span`: those starting in
    /// `(span.start - MAX_DURATION, span.end)`.
    fn candidate_ids(&self, owner: OwnerKind, owner_id: Ulid, span: &Span) -> Vec<Ulid> {
        let Some(list) = self.by_owner.get(&(owner, owner_id)) else {
            return Vec::new();
        };
        let earliest = span.start - MAX_DURATION_MS;
        let lo = list.partition_point(|&(start, _)| start <= earliest);
        let hi = list.partition_point(|&(start, _)| start < span.end);
        if lo >= hi {
            return Vec::new();
        }
        list[lo..hi].iter().map(|&(_, id)| id).collect()
    }

    fn overlapping(&self, owner: OwnerKind, owner_id: Ulid, span: &Span) -> Vec<Booking> {
        self.candidate_ids(owner, owner_id, span)
            .into_iter()
            .filter_map(|id| self.bookings.get(&id).map(|b| b.value().clone()))
            .filter(|b| b.span().overlaps(span))
            .collect()
    }

    /// Exclusion constraint: no two blocking bookings of one expert or one user overlap.
    fn check_exclusion(&self, booking: &Booking) -> Result<(), StoreError> {
        let span = booking.span();
        for owner in [OwnerKind::Expert, OwnerKind::User] {
            if let Some(hit) = self
                .overlapping(owner, booking.owner_id(owner), &span)
                .into_iter()
                .find(|b| b.id != booking.id && b.status.is_blocking())
            {
                return Err(StoreError::Exclusion {
                    owner,
                    conflicting: hit.id,
                });
            }
        }
        Ok(())
    }
}

/// In-process relational store: DashMap tables, a write gate serialising transactions,
/// and an optional group-committed journal for durability.
///
/// Each write transaction runs on its own task. A caller that stops waiting (a timeout,
/// a dropped connection) never leaves a record journaled but unapplied.
pub struct LocalStore {
    tables: Arc<Tables>,
    write_gate: Arc<Mutex<()>>,
    journal_tx: Option<mpsc::Sender<JournalCommand>>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

async fn journal_append(
    journal_tx: Option<&mpsc::Sender<JournalCommand>>,
    record: &JournalRecord,
) -> Result<(), StoreError> {
    let Some(tx) = journal_tx else {
        return Ok(());
    };
    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(JournalCommand::Append {
        record: record.clone(),
        response: resp_tx,
    })
    .await
    .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
    resp_rx
        .await
        .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
        .map_err(|e| StoreError::Journal(e.to_string()))
}

impl LocalStore {
    /// Volatile store with no journal.
    pub fn in_memory() -> Self {
        Self {
            tables: Arc::new(Tables::default()),
            write_gate: Arc::new(Mutex::new(())),
            journal_tx: None,
        }
    }

    /// Replay the journal at `path` and keep appending to it. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, records) = Journal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(journal::writer_loop(journal, rx));

        let mut store = Self::in_memory();
        for record in &records {
            store.tables.apply(record);
        }
        store.journal_tx = Some(tx);
        tracing::info!(path = %path.display(), records = records.len(), "store replayed");
        Ok(store)
    }

    pub fn booking_count(&self) -> usize {
        self.tables.bookings.len()
    }

    /// Run one write transaction to completion on a separate task: take the gate, let
    /// `plan` validate against current state and produce the record, journal it, apply it.
    async fn transact<R, F>(&self, plan: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Tables) -> Result<(JournalRecord, R), StoreError> + Send + 'static,
    {
        let tables = self.tables.clone();
        let gate = self.write_gate.clone();
        let journal_tx = self.journal_tx.clone();
        let task = tokio::spawn(async move {
            let _gate = gate.lock_owned().await;
            let (record, out) = plan(tables.as_ref())?;
            journal_append(journal_tx.as_ref(), &record).await?;
            tables.apply(&record);
            Ok::<R, StoreError>(out)
        });
        task.await
            .map_err(|e| StoreError::Journal(format!("write task failed: {e}")))?
    }

    /// Rewrite the journal as the minimal record set that recreates the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(tx) = &self.journal_tx else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        let tables = &self.tables;

        let mut records = Vec::with_capacity(tables.bookings.len());
        for entry in tables.bookings.iter() {
            let history = tables
                .history
                .get(entry.key())
                .map(|h| h.value().clone())
                .unwrap_or_default();
            records.push(JournalRecord::BookingRestored {
                booking: entry.value().clone(),
                history,
            });
        }
        for entry in tables.working_hours.iter() {
            records.push(JournalRecord::WorkingHoursReplaced {
                expert_id: *entry.key(),
                rules: entry.value().clone(),
            });
        }
        for entry in tables.unavailability.iter() {
            for window in entry.value() {
                records.push(JournalRecord::UnavailabilityAdded {
                    window: window.clone(),
                });
            }
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(JournalCommand::Compact {
            records,
            response: resp_tx,
        })
        .await
        .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        resp_rx
            .await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.journal_tx else {
            return 0;
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        if tx
            .send(JournalCommand::AppendsSinceCompact { response: resp_tx })
            .await
            .is_err()
        {
            return 0;
        }
        resp_rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for LocalStore {
    async fn insert_booking(
        &self,
        booking: Booking,
        entry: StatusHistoryEntry,
    ) -> Result<(), StoreError> {
        self.transact(move |tables| {
            if tables.bookings.contains_key(&booking.id) {
                return Err(StoreError::AlreadyExists(booking.id));
            }
            if booking.status.is_blocking() {
                tables.check_exclusion(&booking)?;
            }
            Ok((JournalRecord::BookingInserted { booking, entry }, ()))
        })
        .await
    }

    async fn update_booking(
        &self,
        booking: Booking,
        expected: BookingStatus,
        entry: StatusHistoryEntry,
    ) -> Result<(), StoreError> {
        self.transact(move |tables| {
            let current = tables
                .bookings
                .get(&booking.id)
                .map(|b| b.status)
                .ok_or(StoreError::NotFound(booking.id))?;
            if current != expected {
                return Err(StoreError::StaleWrite(booking.id));
            }
            if booking.status.is_blocking() {
                tables.check_exclusion(&booking)?;
            }
            Ok((JournalRecord::BookingUpdated { booking, entry }, ()))
        })
        .await
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn blocking_overlaps(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .tables
            .overlapping(owner, owner_id, &span)
            .into_iter()
            .filter(|b| b.status.is_blocking() && Some(b.id) != exclude)
            .collect())
    }

    async fn bookings_for_owner(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.tables.overlapping(owner, owner_id, &span))
    }

    async fn status_history(&self, booking_id: Ulid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        if !self.tables.bookings.contains_key(&booking_id) {
            return Err(StoreError::NotFound(booking_id));
        }
        Ok(self
            .tables
            .history
            .get(&booking_id)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }

    async fn working_hours(&self, expert_id: Ulid) -> Result<Vec<WorkingHourRule>, StoreError> {
        Ok(self
            .tables
            .working_hours
            .get(&expert_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn replace_working_hours(
        &self,
        expert_id: Ulid,
        rules: Vec<WorkingHourRule>,
    ) -> Result<(), StoreError> {
        self.transact(move |_| Ok((JournalRecord::WorkingHoursReplaced { expert_id, rules }, ())))
            .await
    }

    async fn unavailability(
        &self,
        expert_id: Ulid,
        span: Span,
    ) -> Result<Vec<UnavailabilityWindow>, StoreError> {
        Ok(self
            .tables
            .unavailability
            .get(&expert_id)
            .map(|ws| {
                ws.iter()
                    .filter(|w| w.start < span.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_unavailability(&self, window: UnavailabilityWindow) -> Result<(), StoreError> {
        self.transact(move |tables| {
            if tables.window_owner.contains_key(&window.id) {
                return Err(StoreError::AlreadyExists(window.id));
            }
            Ok((JournalRecord::UnavailabilityAdded { window }, ()))
        })
        .await
    }

    async fn remove_unavailability(&self, id: Ulid) -> Result<UnavailabilityWindow, StoreError> {
        self.transact(move |tables| {
            let expert_id = tables
                .window_owner
                .get(&id)
                .map(|e| *e.value())
                .ok_or(StoreError::NotFound(id))?;
            let window = tables
                .unavailability
                .get(&expert_id)
                .and_then(|ws| ws.iter().find(|w| w.id == id).cloned())
                .ok_or(StoreError::NotFound(id))?;
            Ok((JournalRecord::UnavailabilityRemoved { id, expert_id }, window))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn test_journal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("consultd_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(expert_id: Ulid, user_id: Ulid, start: Ms, minutes: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id,
            expert_id,
            start,
            duration_minutes: minutes,
            kind: BookingKind::Online,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            user_notes: None,
            expert_notes: None,
            meeting_link: None,
            fee: None,
            created_at: BASE,
            updated_at: BASE,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_at: None,
        }
    }

    fn created(b: &Booking) -> StatusHistoryEntry {
        StatusHistoryEntry {
            booking_id: b.id,
            old_status: None,
            new_status: b.status,
            actor_id: b.user_id,
            reason: None,
            at: BASE,
            rescheduled_from: None,
            rescheduled_to: None,
        }
    }

    fn moved(b: &Booking, from: BookingStatus) -> StatusHistoryEntry {
        StatusHistoryEntry {
            old_status: Some(from),
            new_status: b.status,
            ..created(b)
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = LocalStore::in_memory();
        let b = booking(Ulid::new(), Ulid::new(), BASE, 60);
        store.insert_booking(b.clone(), created(&b)).await.unwrap();
        assert_eq!(store.get_booking(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(store.status_history(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = LocalStore::in_memory();
        let b = booking(Ulid::new(), Ulid::new(), BASE, 60);
        store.insert_booking(b.clone(), created(&b)).await.unwrap();
        let err = store.insert_booking(b.clone(), created(&b)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn exclusion_on_expert_and_user() {
        let store = LocalStore::in_memory();
        let expert = Ulid::new();
        let user = Ulid::new();
        let first = booking(expert, user, BASE, 60);
        store.insert_booking(first.clone(), created(&first)).await.unwrap();

        let same_expert = booking(expert, Ulid::new(), BASE + 30 * MINUTE_MS, 30);
        let err = store
            .insert_booking(same_expert.clone(), created(&same_expert))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exclusion { owner: OwnerKind::Expert, conflicting } if conflicting == first.id));

        let same_user = booking(Ulid::new(), user, BASE + 59 * MINUTE_MS, 15);
        let err = store
            .insert_booking(same_user.clone(), created(&same_user))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exclusion { owner: OwnerKind::User, .. }));

        // Back-to-back is fine.
        let next = booking(expert, user, BASE + HOUR_MS, 30);
        store.insert_booking(next.clone(), created(&next)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_bookings_do_not_block() {
        let store = LocalStore::in_memory();
        let expert = Ulid::new();
        let mut first = booking(expert, Ulid::new(), BASE, 60);
        store.insert_booking(first.clone(), created(&first)).await.unwrap();

        first.status = BookingStatus::Cancelled;
        store
            .update_booking(first.clone(), BookingStatus::Pending, moved(&first, BookingStatus::Pending))
            .await
            .unwrap();

        let again = booking(expert, Ulid::new(), BASE, 60);
        store.insert_booking(again.clone(), created(&again)).await.unwrap();
        let blocking = store
            .blocking_overlaps(OwnerKind::Expert, expert, Span::new(BASE, BASE + HOUR_MS), None)
            .await
            .unwrap();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].id, again.id);
    }

    #[tokio::test]
    async fn stale_write_rejected() {
        let store = LocalStore::in_memory();
        let mut b = booking(Ulid::new(), Ulid::new(), BASE, 60);
        store.insert_booking(b.clone(), created(&b)).await.unwrap();

        b.status = BookingStatus::Confirmed;
        let err = store
            .update_booking(b.clone(), BookingStatus::Confirmed, moved(&b, BookingStatus::Confirmed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite(_)));
        assert_eq!(store.status_history(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn moving_a_booking_reindexes_it() {
        let store = LocalStore::in_memory();
        let expert = Ulid::new();
        let mut b = booking(expert, Ulid::new(), BASE, 60);
        store.insert_booking(b.clone(), created(&b)).await.unwrap();

        b.start = BASE + 5 * HOUR_MS;
        store
            .update_booking(b.clone(), BookingStatus::Pending, moved(&b, BookingStatus::Pending))
            .await
            .unwrap();

        let old_slot = Span::new(BASE, BASE + HOUR_MS);
        let new_slot = Span::new(BASE + 5 * HOUR_MS, BASE + 6 * HOUR_MS);
        assert!(store.blocking_overlaps(OwnerKind::Expert, expert, old_slot, None).await.unwrap().is_empty());
        assert_eq!(store.blocking_overlaps(OwnerKind::Expert, expert, new_slot, None).await.unwrap().len(), 1);
        assert!(store.blocking_overlaps(OwnerKind::Expert, expert, new_slot, Some(b.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_booking_found_from_later_window() {
        let store = LocalStore::in_memory();
        let expert = Ulid::new();
        let b = booking(expert, Ulid::new(), BASE, 240);
        store.insert_booking(b.clone(), created(&b)).await.unwrap();

        let late = Span::new(BASE + 3 * HOUR_MS, BASE + 5 * HOUR_MS);
        let hits = store.bookings_for_owner(OwnerKind::Expert, expert, late).await.unwrap();
        assert_eq!(hits.len(), 1);
        let after = Span::new(BASE + 4 * HOUR_MS, BASE + 5 * HOUR_MS);
        assert!(store.bookings_for_owner(OwnerKind::Expert, expert, after).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailability_add_remove() {
        let store = LocalStore::in_memory();
        let expert = Ulid::new();
        let window = UnavailabilityWindow {
            id: Ulid::new(),
            expert_id: expert,
            start: BASE,
            end: BASE + HOUR_MS,
            recurrence: None,
            until: None,
            reason: None,
        };
        store.add_unavailability(window.clone()).await.unwrap();
        let span = Span::new(BASE - DAY_MS, BASE + DAY_MS);
        assert_eq!(store.unavailability(expert, span).await.unwrap(), vec![window.clone()]);

        let removed = store.remove_unavailability(window.id).await.unwrap();
        assert_eq!(removed, window);
        assert!(store.unavailability(expert, span).await.unwrap().is_empty());
        assert!(matches!(
            store.remove_unavailability(window.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn journal_replay_restores_state() {
        let path = test_journal_path("replay.journal");
        let expert = Ulid::new();
        let mut b = booking(expert, Ulid::new(), BASE, 60);
        {
            let store = LocalStore::open(&path).unwrap();
            store.insert_booking(b.clone(), created(&b)).await.unwrap();
            b.status = BookingStatus::Confirmed;
            store
                .update_booking(b.clone(), BookingStatus::Pending, moved(&b, BookingStatus::Pending))
                .await
                .unwrap();
            assert_eq!(store.appends_since_compact().await, 2);
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get_booking(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(store.status_history(b.id).await.unwrap().len(), 2);
        assert_eq!(
            store
                .blocking_overlaps(OwnerKind::Expert, expert, b.span(), None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn compact_preserves_history() {
        let path = test_journal_path("compact.journal");
        let mut b = booking(Ulid::new(), Ulid::new(), BASE, 60);
        {
            let store = LocalStore::open(&path).unwrap();
            store.insert_booking(b.clone(), created(&b)).await.unwrap();
            b.status = BookingStatus::Confirmed;
            store
                .update_booking(b.clone(), BookingStatus::Pending, moved(&b, BookingStatus::Pending))
                .await
                .unwrap();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = LocalStore::open(&path).unwrap();
        let history = store.status_history(b.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].new_status, BookingStatus::Confirmed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_insert_still_lands() {
        let path = test_journal_path("abandoned.journal");
        let expert = Ulid::new();
        let b = booking(expert, Ulid::new(), BASE, 60);
        {
            let store = LocalStore::open(&path).unwrap();
            // The caller gives up right after the first poll.
            let _ = tokio::time::timeout(
                std::time::Duration::ZERO,
                store.insert_booking(b.clone(), created(&b)),
            )
            .await;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;

            assert_eq!(store.get_booking(b.id).await.unwrap(), Some(b.clone()));
            let clash = booking(expert, Ulid::new(), BASE + 30 * 60_000, 60);
            let err = store.insert_booking(clash.clone(), created(&clash)).await.unwrap_err();
            assert!(matches!(err, StoreError::Exclusion { conflicting, .. } if conflicting == b.id));
        }

        let records = Journal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.booking_count(), 1);
    }
}
