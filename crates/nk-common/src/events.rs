//! Bus d'événements pour la communication inter-modules.
//!
//! Two ways to observe events:
//! - [`EventBus::next`] registers a one-shot subscription for the next event
//!   of a given type. Nothing is buffered: a subscription only sees events
//!   published after it was created, so create it *before* triggering the
//!   action that produces the event.
//! - [`EventBus::emitter`] returns an ongoing observer receiving every event,
//!   for logging and UI purposes.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::trace;

use crate::types::{MacAddr, WifiNetwork};

const EMITTER_CAPACITY: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus was dropped before the event arrived")]
    Closed,
    #[error("No event received within {0:?}")]
    Timeout(Duration),
}

/// An event type carried by the bus.
pub trait BusEvent: Into<Event> + Clone + Send + 'static {
    const KIND: EventKind;

    fn from_event(event: Event) -> Option<Self>;

    fn from_event_ref(event: &Event) -> Option<&Self>;
}

macro_rules! event_catalogue {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Every event that can travel on the bus.
        #[derive(Debug, Clone, Serialize)]
        #[serde(tag = "type", content = "data")]
        pub enum Event {
            $($variant($ty),)*
        }

        /// Tag of an [`Event`], used to key subscriptions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum EventKind {
            $($variant,)*
        }

        impl Event {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(Event::$variant(_) => EventKind::$variant,)*
                }
            }
        }

        $(
            impl From<$ty> for Event {
                fn from(event: $ty) -> Self {
                    Event::$variant(event)
                }
            }

            impl BusEvent for $ty {
                const KIND: EventKind = EventKind::$variant;

                fn from_event(event: Event) -> Option<Self> {
                    match event {
                        Event::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_event_ref(event: &Event) -> Option<&Self> {
                    match event {
                        Event::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

event_catalogue! {
    DhcpLease(DhcpLeaseEvent),
    ModuleStarted(ModuleStartedEvent),
    ModuleStopped(ModuleStoppedEvent),
    AdapterAddressesChanged(AdapterAddressesChangedEvent),
    WifiScanComplete(WifiScanCompleteEvent),
    WifiConnected(WifiConnectedEvent),
    WifiDisconnected(WifiDisconnectedEvent),
    WifiApStarted(WifiApStartedEvent),
    WifiApStopped(WifiApStoppedEvent),
    WifiApClientConnected(WifiApClientConnectedEvent),
    WifiApClientDisconnected(WifiApClientDisconnectedEvent),
    WifiRaw(WifiRawEvent),
}

/// A DHCP client was ACK-ed an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpLeaseEvent {
    pub client: MacAddr,
    pub address: Ipv4Addr,
    pub host_name: Option<String>,
    pub vendor_cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStartedEvent {
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStoppedEvent {
    pub module: String,
    /// Set when the module context terminated on an error
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterAddressesChangedEvent {
    pub adapter: String,
    pub addresses: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WifiScanCompleteEvent {
    pub networks: Vec<WifiNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiConnectedEvent {
    pub ssid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiDisconnectedEvent {
    pub ssid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiApStartedEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiApStoppedEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiApClientConnectedEvent {
    pub client: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiApClientDisconnectedEvent {
    pub client: MacAddr,
}

/// Backend notification with no dedicated event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiRawEvent {
    pub code: String,
    pub data: Option<String>,
}

type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    filter: Option<EventFilter>,
    tx: oneshot::Sender<Event>,
}

pub struct EventBus {
    /// One-shot waiters, keyed by event tag
    waiters: Mutex<HashMap<EventKind, Vec<Waiter>>>,
    next_id: AtomicU64,
    /// Observateurs permanents (logs, UI)
    emitter: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            emitter: broadcast::channel(EMITTER_CAPACITY).0,
        }
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Waiter>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<T: BusEvent>(&self, filter: Option<EventFilter>) -> Subscription<T> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.lock_waiters();
        let list = waiters.entry(T::KIND).or_default();
        list.retain(|w| !w.tx.is_closed());
        list.push(Waiter { id, filter, tx });
        Subscription {
            rx,
            _marker: PhantomData,
        }
    }

    /// Subscribe to the next event of type `T`.
    ///
    /// The subscription is registered immediately, not when first awaited.
    pub fn next<T: BusEvent>(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Subscribe to the next event of type `T` accepted by `filter`.
    ///
    /// Filters run on the publishing thread, outside the waiter lock.
    pub fn next_where<T, F>(&self, filter: F) -> Subscription<T>
    where
        T: BusEvent,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let filter: EventFilter =
            Arc::new(move |event| T::from_event_ref(event).is_some_and(&filter));
        self.register(Some(filter))
    }

    /// Ongoing observer of every published event.
    pub fn emitter(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe()
    }

    /// Deliver an event to every matching subscription, then to the emitters.
    ///
    /// Returns the number of subscriptions fulfilled. Never blocks.
    pub fn publish(&self, event: impl Into<Event>) -> usize {
        let event = event.into();
        let kind = event.kind();

        let candidates: Vec<(u64, Option<EventFilter>)> = {
            let mut waiters = self.lock_waiters();
            match waiters.get_mut(&kind) {
                Some(list) => {
                    list.retain(|w| !w.tx.is_closed());
                    list.iter().map(|w| (w.id, w.filter.clone())).collect()
                }
                None => Vec::new(),
            }
        };

        // Filters may call back into the bus
        let accepted: HashSet<u64> = candidates
            .into_iter()
            .filter(|(_, filter)| filter.as_ref().is_none_or(|filter| (**filter)(&event)))
            .map(|(id, _)| id)
            .collect();

        // A concurrent publish may have taken some of them meanwhile
        let matched: Vec<Waiter> = if accepted.is_empty() {
            Vec::new()
        } else {
            let mut waiters = self.lock_waiters();
            match waiters.get_mut(&kind) {
                Some(list) => {
                    let (matched, pending): (Vec<_>, Vec<_>) = std::mem::take(list)
                        .into_iter()
                        .partition(|w| accepted.contains(&w.id));
                    *list = pending;
                    matched
                }
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for waiter in matched {
            if waiter.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(?kind, delivered, "Event published");

        // No emitter listening is fine
        let _ = self.emitter.send(event);
        delivered
    }

    /// Number of registered one-shot subscriptions for a kind.
    pub fn pending(&self, kind: EventKind) -> usize {
        self.lock_waiters()
            .get(&kind)
            .map(|list| list.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending one-shot subscription for the next event of type `T`.
#[must_use = "a subscription only fires if it is awaited"]
pub struct Subscription<T> {
    rx: oneshot::Receiver<Event>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BusEvent> Subscription<T> {
    /// Wait for the event. Suspends indefinitely if nothing is published.
    pub async fn recv(self) -> Result<T, BusError> {
        let event = self.rx.await.map_err(|_| BusError::Closed)?;
        T::from_event(event).ok_or(BusError::Closed)
    }

    pub async fn recv_timeout(self, timeout: Duration) -> Result<T, BusError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| BusError::Timeout(timeout))?
    }

    /// Blocking wait, for synchronous callers outside any async runtime.
    pub fn recv_blocking(self) -> Result<T, BusError> {
        let event = self.rx.blocking_recv().map_err(|_| BusError::Closed)?;
        T::from_event(event).ok_or(BusError::Closed)
    }
}
