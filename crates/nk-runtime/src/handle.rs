use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use nk_common::events::{Event, EventBus, ModuleStartedEvent, ModuleStoppedEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::error::ModuleError;
use crate::module::{CallFn, Field, Module, ModuleContext, boxed_call};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Idle,
    Running,
    Stopping,
    Failed,
}

/// What the context thread hands back when it exits.
type ContextExit<M> = (M, Option<String>);

/// Reply to a dispatched call, `Err` holding the panic message.
type CallReply<R> = Result<anyhow::Result<R>, String>;

struct RunningContext<M: Module> {
    thread: JoinHandle<ContextExit<M>>,
    thread_id: ThreadId,
    calls: mpsc::UnboundedSender<CallFn<M>>,
    shutdown: Arc<Notify>,
    should_run: Arc<AtomicBool>,
}

enum Slot<M: Module> {
    Idle(M),
    Running(RunningContext<M>),
    Stopping,
    Poisoned,
}

struct Lifecycle<M: Module> {
    slot: Slot<M>,
    starts: u32,
    last_state_change: i64,
    last_error: Option<String>,
}

/// Owner-side handle of a module: start/stop it and dispatch calls onto its
/// execution context.
pub struct ModuleHandle<M: Module> {
    name: String,
    bus: Arc<EventBus>,
    inner: Mutex<Lifecycle<M>>,
}

/// Snapshot of a handle's lifecycle bookkeeping.
pub(crate) struct LifecycleInfo {
    pub state: ModuleState,
    pub starts: u32,
    pub last_state_change: i64,
    pub last_error: Option<String>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<M: Module> ModuleHandle<M> {
    pub fn new(name: impl Into<String>, module: M, bus: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            bus,
            inner: Mutex::new(Lifecycle {
                slot: Slot::Idle(module),
                starts: 0,
                last_state_change: now_millis(),
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<M>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.reap(&mut inner);
        inner
    }

    /// Collect a context which exited on its own (error or panic).
    fn reap(&self, inner: &mut Lifecycle<M>) {
        let finished = matches!(&inner.slot, Slot::Running(ctx) if ctx.thread.is_finished());
        if !finished {
            return;
        }
        if let Slot::Running(ctx) = std::mem::replace(&mut inner.slot, Slot::Poisoned) {
            self.finish(inner, ctx.thread);
        }
    }

    fn finish(&self, inner: &mut Lifecycle<M>, thread: JoinHandle<ContextExit<M>>) {
        inner.last_state_change = now_millis();
        match thread.join() {
            Ok((module, error)) => {
                inner.slot = Slot::Idle(module);
                if error.is_some() {
                    inner.last_error = error;
                }
            }
            Err(_) => {
                error!("{}: context panicked", self.name);
                inner.slot = Slot::Poisoned;
                inner.last_error = Some("context panicked".to_string());
            }
        }
    }

    pub fn state(&self) -> ModuleState {
        match self.lock().slot {
            Slot::Idle(_) => ModuleState::Idle,
            Slot::Running(_) => ModuleState::Running,
            Slot::Stopping => ModuleState::Stopping,
            Slot::Poisoned => ModuleState::Failed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ModuleState::Running
    }

    pub(crate) fn info(&self) -> LifecycleInfo {
        let state = self.state();
        let inner = self.lock();
        LifecycleInfo {
            state,
            starts: inner.starts,
            last_state_change: inner.last_state_change,
            last_error: inner.last_error.clone(),
        }
    }

    /// Spawn the execution context and run `setup` in it.
    ///
    /// Returns once the context is alive and set up, not when it finishes.
    pub fn start(&self) -> Result<(), ModuleError> {
        let mut inner = self.lock();
        let module = match std::mem::replace(&mut inner.slot, Slot::Poisoned) {
            Slot::Idle(module) => module,
            Slot::Poisoned => {
                return Err(ModuleError::Poisoned {
                    module: self.name.clone(),
                });
            }
            other => {
                inner.slot = other;
                return Err(ModuleError::AlreadyRunning {
                    module: self.name.clone(),
                });
            }
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(source) => {
                inner.slot = Slot::Idle(module);
                return Err(ModuleError::Spawn {
                    module: self.name.clone(),
                    source,
                });
            }
        };

        info!("Starting {}", self.name);
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let should_run = Arc::new(AtomicBool::new(true));
        let ctx = ModuleContext::new(
            self.name.clone(),
            Arc::clone(&self.bus),
            calls_tx.clone(),
            Arc::clone(&should_run),
        );
        let (ready_tx, ready_rx) = sync_channel::<anyhow::Result<()>>(1);

        let context_shutdown = Arc::clone(&shutdown);
        let spawned = std::thread::Builder::new()
            .name(format!("nk-{}", self.name))
            .spawn(move || {
                let span = info_span!("module", name = %ctx.name());
                runtime.block_on(
                    run_context(module, ctx, calls_rx, context_shutdown, ready_tx).instrument(span),
                )
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(source) => {
                inner.last_error = Some(source.to_string());
                return Err(ModuleError::Spawn {
                    module: self.name.clone(),
                    source,
                });
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                inner.starts += 1;
                inner.last_state_change = now_millis();
                inner.last_error = None;
                inner.slot = Slot::Running(RunningContext {
                    thread_id: thread.thread().id(),
                    thread,
                    calls: calls_tx,
                    shutdown,
                    should_run,
                });
                Ok(())
            }
            Ok(Err(source)) => {
                self.finish(&mut inner, thread);
                inner.last_error = Some(format!("{source:#}"));
                Err(ModuleError::Setup {
                    module: self.name.clone(),
                    source,
                })
            }
            // The context died before reporting, only a panic does that
            Err(_) => {
                self.finish(&mut inner, thread);
                Err(ModuleError::Poisoned {
                    module: self.name.clone(),
                })
            }
        }
    }

    /// Ask the context to stop, wait for it to exit and return to idle.
    ///
    /// Stopping an idle module is a no-op.
    pub fn stop(&self) -> Result<(), ModuleError> {
        let ctx = {
            let mut inner = self.lock();
            let thread_id = match &inner.slot {
                Slot::Running(ctx) => ctx.thread_id,
                _ => return Ok(()),
            };
            if thread_id == std::thread::current().id() {
                return Err(ModuleError::Reentrant {
                    module: self.name.clone(),
                });
            }
            match std::mem::replace(&mut inner.slot, Slot::Stopping) {
                Slot::Running(ctx) => ctx,
                other => {
                    inner.slot = other;
                    return Ok(());
                }
            }
        };

        info!("Stopping {} (request)", self.name);
        ctx.should_run.store(false, Ordering::Release);
        ctx.shutdown.notify_one();
        drop(ctx.calls);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.finish(&mut inner, ctx.thread);
        match inner.slot {
            Slot::Poisoned => Err(ModuleError::Poisoned {
                module: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn dispatch<R, F>(&self, f: F) -> Result<oneshot::Receiver<CallReply<R>>, ModuleError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, anyhow::Result<R>>
            + Send
            + 'static,
    {
        let calls = {
            let inner = self.lock();
            match &inner.slot {
                Slot::Running(ctx) if ctx.thread_id == std::thread::current().id() => {
                    return Err(ModuleError::Reentrant {
                        module: self.name.clone(),
                    });
                }
                Slot::Running(ctx) => ctx.calls.clone(),
                Slot::Poisoned => {
                    return Err(ModuleError::Poisoned {
                        module: self.name.clone(),
                    });
                }
                _ => {
                    return Err(ModuleError::NotRunning {
                        module: self.name.clone(),
                    });
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let call = boxed_call(move |module, ctx| {
            Box::pin(async move {
                let result = AssertUnwindSafe(async move { f(module, ctx).await })
                    .catch_unwind()
                    .await
                    .map_err(|payload| panic_message(&*payload));
                // The caller may have given up waiting
                let _ = tx.send(result);
            })
        });
        calls.send(call).map_err(|_| ModuleError::NotRunning {
            module: self.name.clone(),
        })?;
        Ok(rx)
    }

    fn reply<R>(
        &self,
        reply: Result<CallReply<R>, oneshot::error::RecvError>,
    ) -> Result<R, ModuleError> {
        match reply {
            Ok(Ok(result)) => result.map_err(ModuleError::Call),
            Ok(Err(message)) => Err(ModuleError::Panicked {
                module: self.name.clone(),
                message,
            }),
            Err(_) => Err(ModuleError::NotRunning {
                module: self.name.clone(),
            }),
        }
    }

    /// Run `f` on the module's context and wait for its result.
    ///
    /// Errors returned by `f` come back as [`ModuleError::Call`], a panic
    /// as [`ModuleError::Panicked`].
    pub async fn call<R, F>(&self, f: F) -> Result<R, ModuleError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, anyhow::Result<R>>
            + Send
            + 'static,
    {
        let rx = self.dispatch(f)?;
        self.reply(rx.await)
    }

    /// Blocking variant of [`call`](Self::call), for synchronous callers.
    ///
    /// Must not be used from inside an async runtime.
    pub fn call_blocking<R, F>(&self, f: F) -> Result<R, ModuleError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut M, &'a ModuleContext<M>) -> LocalBoxFuture<'a, anyhow::Result<R>>
            + Send
            + 'static,
    {
        let rx = self.dispatch(f)?;
        self.reply(rx.blocking_recv())
    }

    /// Write a configuration field.
    ///
    /// Fields listed in `M::PRE_RUN_CONFIG` are refused while the module
    /// runs. Other fields are written directly when idle, or queued on the
    /// context when running (applied before any later call).
    pub fn set<V>(&self, field: Field<M, V>, value: V) -> Result<(), ModuleError>
    where
        V: Send + 'static,
    {
        let mut inner = self.lock();
        let calls = match &mut inner.slot {
            Slot::Idle(module) => {
                trace!("{}: set {}", self.name, field.name());
                field.apply(module, value);
                return Ok(());
            }
            Slot::Poisoned => {
                return Err(ModuleError::Poisoned {
                    module: self.name.clone(),
                });
            }
            _ if M::PRE_RUN_CONFIG.contains(&field.name()) => {
                return Err(ModuleError::ConfigState {
                    module: self.name.clone(),
                    field: field.name(),
                });
            }
            Slot::Running(ctx) => ctx.calls.clone(),
            Slot::Stopping => {
                return Err(ModuleError::NotRunning {
                    module: self.name.clone(),
                });
            }
        };
        drop(inner);

        let name = self.name.clone();
        let call = boxed_call(move |module, _ctx| {
            trace!("{name}: set {}", field.name());
            field.apply(module, value);
            Box::pin(async {})
        });
        calls.send(call).map_err(|_| ModuleError::NotRunning {
            module: self.name.clone(),
        })
    }

    /// Read from an idle module. Running modules are read with `call`.
    pub fn inspect<R>(&self, read: impl FnOnce(&M) -> R) -> Result<R, ModuleError> {
        match &self.lock().slot {
            Slot::Idle(module) => Ok(read(module)),
            Slot::Poisoned => Err(ModuleError::Poisoned {
                module: self.name.clone(),
            }),
            _ => Err(ModuleError::AlreadyRunning {
                module: self.name.clone(),
            }),
        }
    }
}

impl<M: Module> Drop for ModuleHandle<M> {
    fn drop(&mut self) {
        match self.stop() {
            Ok(()) => {}
            // Last reference dropped on the context itself: it cannot be joined
            // from there, so only ask it to wind down
            Err(ModuleError::Reentrant { .. }) => {
                let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Slot::Running(ctx) = &inner.slot {
                    ctx.should_run.store(false, Ordering::Release);
                    ctx.shutdown.notify_one();
                }
            }
            Err(e) => warn!("{e}"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Await a module hook, turning a panic into an error.
async fn guarded<T>(
    hook: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("{hook} panicked: {}", panic_message(&*payload))),
    }
}

async fn run_call<M: Module>(call: CallFn<M>, module: &mut M, ctx: &ModuleContext<M>) {
    let result = AssertUnwindSafe(async move { call(module, ctx).await })
        .catch_unwind()
        .await;
    if let Err(payload) = result {
        error!("Queued call panicked: {}", panic_message(&*payload));
    }
}

async fn cleanup<M: Module>(module: &mut M) {
    if let Err(payload) = AssertUnwindSafe(module.cleanup()).catch_unwind().await {
        error!("cleanup panicked: {}", panic_message(&*payload));
    }
}

enum Wake<M: Module> {
    Shutdown,
    Call(CallFn<M>),
    Event(Result<Event, RecvError>),
    Io(anyhow::Result<M::Io>),
}

async fn run_context<M: Module>(
    mut module: M,
    ctx: ModuleContext<M>,
    mut calls: mpsc::UnboundedReceiver<CallFn<M>>,
    shutdown: Arc<Notify>,
    ready: std::sync::mpsc::SyncSender<anyhow::Result<()>>,
) -> ContextExit<M> {
    if let Err(e) = guarded("setup", module.setup(&ctx)).await {
        cleanup(&mut module).await;
        let _ = ready.send(Err(e));
        return (module, None);
    }
    // Subscribe before reporting ready so no event published after start() is missed
    let events = ctx.bus().emitter();
    // start() is blocked on this, it cannot have gone away
    let _ = ready.send(Ok(()));
    ctx.publish(ModuleStartedEvent {
        module: ctx.name().to_string(),
    });

    let result = event_loop(&mut module, &ctx, &mut calls, events, &shutdown).await;

    // Calls queued before the stop request still get an answer
    calls.close();
    while let Ok(call) = calls.try_recv() {
        run_call(call, &mut module, &ctx).await;
    }

    let error = match result {
        Ok(()) => {
            debug!("Finished run()");
            None
        }
        Err(e) => {
            error!("Module context terminated: {e:#}");
            Some(format!("{e:#}"))
        }
    };
    cleanup(&mut module).await;
    ctx.publish(ModuleStoppedEvent {
        module: ctx.name().to_string(),
        error: error.clone(),
    });
    (module, error)
}

async fn event_loop<M: Module>(
    module: &mut M,
    ctx: &ModuleContext<M>,
    calls: &mut mpsc::UnboundedReceiver<CallFn<M>>,
    mut events: broadcast::Receiver<Event>,
    shutdown: &Notify,
) -> anyhow::Result<()> {
    let kinds = module.subscriptions();
    let mut subscribed = !kinds.is_empty();

    while ctx.should_run() {
        let wake = tokio::select! {
            biased;
            _ = shutdown.notified() => Wake::Shutdown,
            call = calls.recv() => match call {
                Some(call) => Wake::Call(call),
                None => Wake::Shutdown,
            },
            event = events.recv(), if subscribed => Wake::Event(event),
            io = guarded("poll_io", module.poll_io()) => Wake::Io(io),
        };

        match wake {
            Wake::Shutdown => break,
            Wake::Call(call) => run_call(call, module, ctx).await,
            Wake::Event(Ok(event)) => {
                if kinds.contains(&event.kind()) {
                    guarded("on_event", module.on_event(event, ctx)).await?;
                }
            }
            Wake::Event(Err(RecvError::Lagged(skipped))) => {
                warn!("Missed {skipped} events");
            }
            Wake::Event(Err(RecvError::Closed)) => subscribed = false,
            Wake::Io(io) => guarded("on_io", module.on_io(io?, ctx)).await?,
        }
    }
    Ok(())
}
