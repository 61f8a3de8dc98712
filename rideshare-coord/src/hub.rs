//! Live views over trips and pickup requests.
//!
//! One dispatcher task consumes the record store's change feed. For every
//! committed write it recomputes the snapshots of the subscriptions the
//! write can affect and pushes those that differ from what the subscriber
//! last saw. Snapshot computation and registration share one lock, so a new
//! subscriber's initial snapshot and the dispatcher never interleave.
//!
//! A round whose reads fail is repeated on the retry policy's backoff until
//! it succeeds, whether or not more changes arrive. Each subscriber holds at
//! most one undelivered snapshot: a newer one replaces it.

use dashmap::DashMap;
use futures_util::Stream;
use rideshare_core::{CoreResult, RetryPolicy};
use rideshare_pickup::{PickupRequest, PickupStore};
use rideshare_shared::{Collection, RecordChange};
use rideshare_trip::{Trip, TripStore};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::CoordinationResult;

/// Predicate applied to each visible trip of a `watch_trips` subscription.
pub type TripFilter = Arc<dyn Fn(&Trip) -> bool + Send + Sync>;

/// Latest undelivered snapshot of one subscription.
struct Slot<T>(std::sync::Mutex<Option<T>>);

impl<T> Slot<T> {
    fn replace(&self, value: T) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

/// Dispatcher side of a subscription. The capacity-one signal channel only
/// wakes the reader; the snapshot itself sits in the shared slot.
struct Outbox<T> {
    slot: Arc<Slot<T>>,
    signal: mpsc::Sender<()>,
}

impl<T> Outbox<T> {
    /// Returns false once the reader is gone.
    fn send(&self, value: T) -> bool {
        if self.signal.is_closed() {
            return false;
        }
        self.slot.replace(value);
        !matches!(self.signal.try_send(()), Err(TrySendError::Closed(())))
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

struct Inbox<T> {
    slot: Arc<Slot<T>>,
    signal: mpsc::Receiver<()>,
}

impl<T> Inbox<T> {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            if let Some(value) = self.slot.take() {
                return Poll::Ready(Some(value));
            }
            match self.signal.poll_recv(cx) {
                // A wake-up whose snapshot was already taken loops back to
                // an empty slot and parks again.
                Poll::Ready(Some(())) => continue,
                Poll::Ready(None) => return Poll::Ready(self.slot.take()),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn try_recv(&mut self) -> Option<T> {
        let _ = self.signal.try_recv();
        self.slot.take()
    }

    fn close(&mut self) {
        self.signal.close();
        self.slot.take();
    }
}

fn mailbox<T>(initial: T) -> (Outbox<T>, Inbox<T>) {
    let (signal_tx, signal_rx) = mpsc::channel(1);
    let slot = Arc::new(Slot(std::sync::Mutex::new(None)));
    let outbox = Outbox {
        slot: slot.clone(),
        signal: signal_tx,
    };
    outbox.send(initial);
    (outbox, Inbox { slot, signal: signal_rx })
}

enum Watcher {
    Trips {
        filter: Option<TripFilter>,
        tx: Outbox<Vec<Trip>>,
        last: Vec<Trip>,
    },
    Trip {
        trip_id: String,
        tx: Outbox<Option<Trip>>,
        last: Option<Trip>,
    },
    PickupsForTrip {
        trip_id: String,
        tx: Outbox<Vec<PickupRequest>>,
        last: Vec<PickupRequest>,
    },
    Pickup {
        pickup_id: String,
        tx: Outbox<Option<PickupRequest>>,
        last: Option<PickupRequest>,
    },
}

/// Pushes `next` unless the subscriber already has it. Returns false once
/// the subscriber is gone.
fn offer<T: Clone + PartialEq>(tx: &Outbox<T>, last: &mut T, next: T) -> bool {
    if *last == next {
        return !tx.is_closed();
    }
    if !tx.send(next.clone()) {
        return false;
    }
    *last = next;
    true
}

fn filtered(trips: &[Trip], filter: &Option<TripFilter>) -> Vec<Trip> {
    trips
        .iter()
        .filter(|trip| filter.as_ref().map_or(true, |keep| keep(*trip)))
        .cloned()
        .collect()
}

/// Which records a dispatch round has to look at.
enum Scope {
    Key(Collection, String),
    Everything,
}

#[derive(Default)]
struct Wants {
    trip_list: bool,
    trip: bool,
    pickup_list: bool,
    pickup: bool,
}

/// Records loaded for one dispatch round. `None` means not loaded.
#[derive(Default)]
struct View {
    trips: Option<Vec<Trip>>,
    trip: Option<(String, Option<Trip>)>,
    pickups: Option<Vec<PickupRequest>>,
    pickup: Option<(String, Option<PickupRequest>)>,
}

impl View {
    fn trip(&self, trip_id: &str) -> Option<Option<Trip>> {
        if let Some((key, trip)) = &self.trip {
            if key == trip_id {
                return Some(trip.clone());
            }
        }
        self.trips
            .as_ref()
            .map(|trips| trips.iter().find(|trip| trip.id == trip_id).cloned())
    }

    fn pickup(&self, pickup_id: &str) -> Option<Option<PickupRequest>> {
        if let Some((key, pickup)) = &self.pickup {
            if key == pickup_id {
                return Some(pickup.clone());
            }
        }
        self.pickups
            .as_ref()
            .map(|pickups| pickups.iter().find(|pickup| pickup.id == pickup_id).cloned())
    }

    fn pickups_for(&self, trip_id: &str) -> Option<Vec<PickupRequest>> {
        self.pickups.as_ref().map(|pickups| {
            pickups
                .iter()
                .filter(|pickup| pickup.trip_id == trip_id)
                .cloned()
                .collect()
        })
    }
}

struct HubInner {
    trips: Arc<TripStore>,
    pickups: Arc<PickupStore>,
    retry: RetryPolicy,
    watchers: DashMap<u64, Watcher>,
    next_id: AtomicU64,
    dispatch_lock: Mutex<()>,
    dispatcher: OnceLock<AbortHandle>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get() {
            handle.abort();
        }
    }
}

impl HubInner {
    fn register(&self, watcher: Watcher) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.insert(id, watcher);
        id
    }

    fn wants(&self, scope: &Scope) -> Wants {
        let mut wants = Wants::default();
        for entry in self.watchers.iter() {
            match (entry.value(), scope) {
                (Watcher::Trips { .. }, Scope::Everything | Scope::Key(Collection::Trips, _)) => {
                    wants.trip_list = true
                }
                (Watcher::Trip { .. }, Scope::Everything) => wants.trip_list = true,
                (Watcher::Trip { trip_id, .. }, Scope::Key(Collection::Trips, key)) if trip_id == key => {
                    wants.trip = true
                }
                (Watcher::PickupsForTrip { .. }, Scope::Everything | Scope::Key(Collection::Pickups, _)) => {
                    wants.pickup_list = true
                }
                (Watcher::Pickup { .. }, Scope::Everything) => wants.pickup_list = true,
                (Watcher::Pickup { pickup_id, .. }, Scope::Key(Collection::Pickups, key)) if pickup_id == key => {
                    wants.pickup = true
                }
                _ => {}
            }
        }
        wants
    }

    /// Loads what the round needs. The flag is false when any wanted read
    /// failed.
    async fn load(&self, scope: &Scope, wants: Wants) -> (View, bool) {
        let mut view = View::default();
        let mut complete = true;
        let trips = &self.trips;
        let pickups = &self.pickups;

        if wants.trip_list {
            view.trips = logged(self.retry.run("hub.list_trips", move || trips.list_all()).await);
            complete &= view.trips.is_some();
        }
        if wants.pickup_list {
            view.pickups = logged(self.retry.run("hub.list_pickups", move || pickups.list_all()).await);
            complete &= view.pickups.is_some();
        }
        if let Scope::Key(collection, key) = scope {
            let key = key.as_str();
            if wants.trip && *collection == Collection::Trips {
                view.trip = logged(self.retry.run("hub.find_trip", move || trips.find(key)).await)
                    .map(|trip| (key.to_string(), trip));
                complete &= view.trip.is_some();
            }
            if wants.pickup && *collection == Collection::Pickups {
                view.pickup = logged(self.retry.run("hub.find_pickup", move || pickups.find(key)).await)
                    .map(|pickup| (key.to_string(), pickup));
                complete &= view.pickup.is_some();
            }
        }
        (view, complete)
    }

    /// Runs one round. Returns false when a read failed and some
    /// subscribers may be behind the store.
    async fn dispatch(&self, scope: Scope) -> bool {
        let _serial = self.dispatch_lock.lock().await;

        let wants = self.wants(&scope);
        let (view, complete) = self.load(&scope, wants).await;

        let mut gone = Vec::new();
        for mut entry in self.watchers.iter_mut() {
            let id = *entry.key();
            let alive = match entry.value_mut() {
                Watcher::Trips { filter, tx, last } => match &view.trips {
                    Some(trips) => offer(tx, last, filtered(trips, filter)),
                    None => !tx.is_closed(),
                },
                Watcher::Trip { trip_id, tx, last } => match view.trip(trip_id) {
                    Some(trip) => offer(tx, last, trip),
                    None => !tx.is_closed(),
                },
                Watcher::PickupsForTrip { trip_id, tx, last } => match view.pickups_for(trip_id) {
                    Some(pickups) => offer(tx, last, pickups),
                    None => !tx.is_closed(),
                },
                Watcher::Pickup { pickup_id, tx, last } => match view.pickup(pickup_id) {
                    Some(pickup) => offer(tx, last, pickup),
                    None => !tx.is_closed(),
                },
            };
            if !alive {
                gone.push(id);
            }
        }

        for id in gone {
            debug!("Dropping subscription {} whose receiver is gone", id);
            self.watchers.remove(&id);
        }
        complete
    }
}

fn logged<T>(result: CoreResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Snapshot read failed, the round will be repeated: {}", e);
            None
        }
    }
}

async fn run_dispatcher(hub: Weak<HubInner>, mut feed: broadcast::Receiver<RecordChange>) {
    // Consecutive rounds that failed to read; while non-zero every round is
    // a full refresh.
    let mut failed_rounds: u32 = 0;
    loop {
        let scope = if failed_rounds == 0 {
            match feed.recv().await {
                Ok(change) => Scope::Key(change.collection, change.key),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Change feed lagged by {} events, refreshing every subscription", skipped);
                    Scope::Everything
                }
                Err(RecvError::Closed) => break,
            }
        } else {
            let Some(backoff) = hub.upgrade().map(|hub| hub.retry.backoff_for(failed_rounds)) else {
                break;
            };
            tokio::select! {
                received = feed.recv() => match received {
                    Err(RecvError::Closed) => break,
                    _ => Scope::Everything,
                },
                _ = tokio::time::sleep(backoff) => Scope::Everything,
            }
        };

        let Some(hub) = hub.upgrade() else { break };
        if hub.dispatch(scope).await {
            if failed_rounds > 0 {
                debug!("Subscriptions caught up after {} failed rounds", failed_rounds);
            }
            failed_rounds = 0;
        } else {
            failed_rounds = failed_rounds.saturating_add(1);
        }
    }
    debug!("Subscription dispatcher stopped");
}

/// Registry of live subscriptions.
///
/// Must be created inside a tokio runtime. Both stores have to sit on the
/// record store whose feed the hub follows.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(trips: Arc<TripStore>, pickups: Arc<PickupStore>, retry: RetryPolicy) -> Self {
        // Subscribe before anything else so no commit slips between the
        // feed and the first snapshot.
        let feed = trips.records().subscribe();
        let inner = Arc::new(HubInner {
            trips,
            pickups,
            retry,
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            dispatch_lock: Mutex::new(()),
            dispatcher: OnceLock::new(),
        });

        let task = tokio::spawn(run_dispatcher(Arc::downgrade(&inner), feed));
        let _ = inner.dispatcher.set(task.abort_handle());

        Self { inner }
    }

    /// Visible trips accepted by `filter` (all of them when `None`).
    pub async fn watch_trips(&self, filter: Option<TripFilter>) -> CoordinationResult<Subscription<Vec<Trip>>> {
        let inner = &self.inner;
        let _serial = inner.dispatch_lock.lock().await;

        let trips = &inner.trips;
        let all = inner.retry.run("hub.watch_trips", move || trips.list_all()).await?;
        let initial = filtered(&all, &filter);

        let (tx, rx) = mailbox(initial.clone());
        let id = inner.register(Watcher::Trips { filter, tx, last: initial });
        debug!("Subscription {} watching trips", id);
        Ok(Subscription::new(id, inner, rx))
    }

    /// One trip; `None` while it is absent or removed.
    pub async fn watch_trip(&self, trip_id: &str) -> CoordinationResult<Subscription<Option<Trip>>> {
        let inner = &self.inner;
        let _serial = inner.dispatch_lock.lock().await;

        let trips = &inner.trips;
        let initial = inner.retry.run("hub.watch_trip", move || trips.find(trip_id)).await?;

        let (tx, rx) = mailbox(initial.clone());
        let id = inner.register(Watcher::Trip {
            trip_id: trip_id.to_string(),
            tx,
            last: initial,
        });
        debug!("Subscription {} watching trip {}", id, trip_id);
        Ok(Subscription::new(id, inner, rx))
    }

    /// Every pickup request of a trip, whatever its status.
    pub async fn watch_pickups_for_trip(&self, trip_id: &str) -> CoordinationResult<Subscription<Vec<PickupRequest>>> {
        let inner = &self.inner;
        let _serial = inner.dispatch_lock.lock().await;

        let pickups = &inner.pickups;
        let initial = inner
            .retry
            .run("hub.watch_pickups_for_trip", move || pickups.list_by_trip(trip_id))
            .await?;

        let (tx, rx) = mailbox(initial.clone());
        let id = inner.register(Watcher::PickupsForTrip {
            trip_id: trip_id.to_string(),
            tx,
            last: initial,
        });
        debug!("Subscription {} watching pickups of trip {}", id, trip_id);
        Ok(Subscription::new(id, inner, rx))
    }

    pub async fn watch_pickup(&self, pickup_id: &str) -> CoordinationResult<Subscription<Option<PickupRequest>>> {
        let inner = &self.inner;
        let _serial = inner.dispatch_lock.lock().await;

        let pickups = &inner.pickups;
        let initial = inner.retry.run("hub.watch_pickup", move || pickups.find(pickup_id)).await?;

        let (tx, rx) = mailbox(initial.clone());
        let id = inner.register(Watcher::Pickup {
            pickup_id: pickup_id.to_string(),
            tx,
            last: initial,
        });
        debug!("Subscription {} watching pickup {}", id, pickup_id);
        Ok(Subscription::new(id, inner, rx))
    }

    /// Recomputes every subscription from scratch. The dispatcher does this
    /// on its own when the feed lags.
    pub async fn refresh(&self) {
        self.inner.dispatch(Scope::Everything).await;
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.watchers.len()
    }
}

/// A live view. Yields the current snapshot first, then a new one after
/// every committed write that changes it.
///
/// A reader that falls behind skips intermediate snapshots and receives the
/// newest one.
pub struct Subscription<T> {
    id: u64,
    hub: Weak<HubInner>,
    receiver: Inbox<T>,
    active: bool,
}

impl<T> Subscription<T> {
    fn new(id: u64, hub: &Arc<HubInner>, receiver: Inbox<T>) -> Self {
        Self {
            id,
            hub: Arc::downgrade(hub),
            receiver,
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Waits for the next snapshot. `None` once cancelled.
    pub async fn next(&mut self) -> Option<T> {
        if !self.active {
            return None;
        }
        std::future::poll_fn(|cx| self.receiver.poll_recv(cx)).await
    }

    /// A buffered snapshot, if one is waiting.
    pub fn try_next(&mut self) -> Option<T> {
        if !self.active {
            return None;
        }
        self.receiver.try_recv()
    }

    /// Stops delivery at once; buffered snapshots are discarded. Safe to
    /// call more than once.
    pub fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(hub) = self.hub.upgrade() {
            hub.watchers.remove(&self.id);
        }
        self.receiver.close();
        debug!("Subscription {} cancelled", self.id);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if !this.active {
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}
