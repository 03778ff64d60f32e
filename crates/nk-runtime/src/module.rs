use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::LocalBoxFuture;
use nk_common::events::{BusEvent, Event, EventBus, EventKind, Subscription};
use tokio::sync::mpsc;
use tracing::warn;

/// Work queued on a module context. Runs on the module's own thread, with
/// exclusive access to the module.
pub(crate) type CallFn<M> =
    Box<dyn for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, ()> + Send>;

pub(crate) fn boxed_call<M, F>(f: F) -> CallFn<M>
where
    M: Module,
    F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// A configuration field of `M`, naming the field it writes.
///
/// Declared once per field, usually as an associated const of the module:
///
/// ```ignore
/// const PORT: Field<Self, u16> = Field::new("port", |m: &mut Self, port| m.port = port);
/// ```
pub struct Field<M, V> {
    name: &'static str,
    apply: fn(&mut M, V),
}

impl<M, V> Field<M, V> {
    pub const fn new(name: &'static str, apply: fn(&mut M, V)) -> Self {
        Self { name, apply }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn apply(&self, module: &mut M, value: V) {
        (self.apply)(module, value)
    }
}

impl<M, V> Clone for Field<M, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, V> Copy for Field<M, V> {}

/// A network service run on its own thread and scheduler.
///
/// The runtime drives the module as follows:
/// 1. `setup` once, when the context starts (open sockets, register with the OS)
/// 2. then, one at a time and never concurrently: dispatched calls, bus
///    events matching `subscriptions`, and I/O items returned by `poll_io`
/// 3. `cleanup` once, after a stop request or a failed iteration
///
/// Errors returned from `poll_io`, `on_io` or `on_event` terminate the
/// context; errors local to a single request should be logged and swallowed
/// by the module instead.
#[allow(async_fn_in_trait)]
pub trait Module: Send + Sized + 'static {
    /// Item produced by `poll_io` and consumed by `on_io`
    type Io;

    /// Names of the [`Field`]s which cannot be written while the module is running
    const PRE_RUN_CONFIG: &'static [&'static str] = &[];

    /// Event kinds delivered to `on_event`
    fn subscriptions(&self) -> &'static [EventKind] {
        &[]
    }

    async fn setup(&mut self, _ctx: &ModuleContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Wait for the next inbound item (datagram, OS notification...).
    ///
    /// Must be cancel-safe: the future is dropped whenever a call or an event
    /// is scheduled first. Modules without I/O keep the default, which never
    /// completes.
    async fn poll_io(&mut self) -> anyhow::Result<Self::Io> {
        std::future::pending().await
    }

    async fn on_io(&mut self, _io: Self::Io, _ctx: &ModuleContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_event(&mut self, _event: Event, _ctx: &ModuleContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&mut self) {}
}

/// Module-side view of its execution context.
pub struct ModuleContext<M: Module> {
    name: String,
    bus: Arc<EventBus>,
    calls: mpsc::UnboundedSender<CallFn<M>>,
    should_run: Arc<AtomicBool>,
}

impl<M: Module> ModuleContext<M> {
    pub(crate) fn new(
        name: String,
        bus: Arc<EventBus>,
        calls: mpsc::UnboundedSender<CallFn<M>>,
        should_run: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            bus,
            calls,
            should_run,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn publish(&self, event: impl Into<Event>) -> usize {
        self.bus.publish(event)
    }

    pub fn next<T: BusEvent>(&self) -> Subscription<T> {
        self.bus.next()
    }

    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    /// Queue work on this context without waiting for it.
    pub fn defer<F>(&self, f: F)
    where
        F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, anyhow::Result<()>>
            + Send
            + 'static,
    {
        self.deferrer().defer(f);
    }

    /// Sendable handle for tasks spawned on the module's scheduler.
    pub fn deferrer(&self) -> Deferrer<M> {
        Deferrer {
            name: self.name.clone(),
            calls: self.calls.clone(),
        }
    }
}

/// Queues work on a module context from tasks running beside it.
pub struct Deferrer<M: Module> {
    name: String,
    calls: mpsc::UnboundedSender<CallFn<M>>,
}

impl<M: Module> Clone for Deferrer<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl<M: Module> Deferrer<M> {
    pub fn defer<F>(&self, f: F)
    where
        F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, anyhow::Result<()>>
            + Send
            + 'static,
    {
        let name = self.name.clone();
        let call = boxed_call(move |module, ctx| {
            Box::pin(async move {
                if let Err(e) = f(module, ctx).await {
                    warn!("{name}: deferred call failed: {e:#}");
                }
            })
        });
        if self.calls.send(call).is_err() {
            warn!("{}: context is gone, deferred call dropped", self.name);
        }
    }
}
