//! Process-fatal error routing
//!
//! Loggers arm a handler per [`FatalKind`] by subscribing to a process-wide
//! hub. Exceptions arrive through a chained panic hook (installed once, the
//! first time an exception handler is armed) or [`report_exception`];
//! rejections model failed background work and arrive through
//! [`report_rejection`].
//!
//! When a logger configured to exit on error receives a fatal event, it
//! logs the tagged error, ends every transport registered for that kind and
//! terminates once they all finish or the grace period elapses, whichever
//! comes first.

use crate::error::unpoison;
use crate::payload::{ErrorInfo, FatalKind};
use crate::transport::{in_guarded, Transport};
use futures::future::join_all;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default wait for transports before terminating.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Unarmed,
    Armed,
    Dispatching,
    Exiting,
}

/// Why the exit wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    AllFinished,
    /// The grace period elapsed first.
    DeadlineReached,
}

/// Decides what terminating means.
pub trait Terminator: Send + Sync {
    fn terminate(&self, outcome: ExitOutcome);
}

/// Exits the process with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, outcome: ExitOutcome) {
        tracing::debug!(?outcome, "terminating after fatal error");
        std::process::exit(1);
    }
}

pub(crate) type Subscriber = Arc<dyn Fn(&ErrorInfo) -> Option<JoinHandle<()>> + Send + Sync>;

pub(crate) type SubscriptionId = u64;

#[derive(Default)]
struct FatalHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, FatalKind, Subscriber)>>,
}

static HUB: OnceLock<FatalHub> = OnceLock::new();
static PANIC_HOOK: Once = Once::new();

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

fn hub() -> &'static FatalHub {
    HUB.get_or_init(FatalHub::default)
}

pub(crate) fn subscribe(kind: FatalKind, subscriber: Subscriber) -> SubscriptionId {
    if kind == FatalKind::Exception {
        install_panic_hook();
    }
    let hub = hub();
    let id = hub.next_id.fetch_add(1, Ordering::SeqCst);
    unpoison(hub.subscribers.lock()).push((id, kind, subscriber));
    id
}

pub(crate) fn unsubscribe(id: SubscriptionId) {
    unpoison(hub().subscribers.lock()).retain(|(sub, _, _)| *sub != id);
}

/// Number of handlers currently armed for `kind`.
pub fn subscriber_count(kind: FatalKind) -> usize {
    unpoison(hub().subscribers.lock())
        .iter()
        .filter(|(_, k, _)| *k == kind)
        .count()
}

fn emit(kind: FatalKind, err: &ErrorInfo) -> Vec<JoinHandle<()>> {
    let subscribers: Vec<Subscriber> = unpoison(hub().subscribers.lock())
        .iter()
        .filter(|(_, k, _)| *k == kind)
        .map(|(_, _, s)| s.clone())
        .collect();
    subscribers.iter().filter_map(|s| s(err)).collect()
}

/// Route an uncaught error to every armed exception handler.
pub fn report_exception(err: ErrorInfo) {
    emit(FatalKind::Exception, &err);
}

/// Route a failed background task to every armed rejection handler.
pub fn report_rejection(err: ErrorInfo) {
    emit(FatalKind::Rejection, &err);
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            if in_guarded() || IN_HOOK.with(Cell::get) {
                return;
            }
            IN_HOOK.with(|flag| flag.set(true));

            let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                "panic".to_string()
            };
            let mut err = ErrorInfo::named("Panic", message.clone());
            if let Some(location) = info.location() {
                err = err.with_stack(format!("Panic: {}\n    at {}", message, location));
            }

            // the panicking thread would otherwise unwind past the exit wait
            for handle in emit(FatalKind::Exception, &err) {
                let _ = handle.join();
            }
            IN_HOOK.with(|flag| flag.set(false));
        }));
    });
}

/// End every transport and terminate when they all finish or `grace`
/// elapses. Runs on its own thread and runtime so a panicking or blocked
/// caller runtime cannot stall it.
pub(crate) fn spawn_exit(
    transports: Vec<Transport>,
    grace: Duration,
    terminator: Arc<dyn Terminator>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build();
        let outcome = match runtime {
            Ok(runtime) => {
                let outcome = runtime.block_on(wait_for_transports(transports, grace));
                runtime.shutdown_background();
                outcome
            }
            Err(err) => {
                eprintln!("failed to start exit runtime: {}", err);
                ExitOutcome::DeadlineReached
            }
        };
        terminator.terminate(outcome);
    })
}

pub(crate) async fn wait_for_transports(transports: Vec<Transport>, grace: Duration) -> ExitOutcome {
    let latches = transports.into_iter().map(|transport| async move {
        let ending = transport.clone();
        let _ = tokio::task::spawn_blocking(move || ending.end());
        transport.wait_terminal().await
    });

    tokio::select! {
        _ = join_all(latches) => ExitOutcome::AllFinished,
        _ = tokio::time::sleep(grace) => ExitOutcome::DeadlineReached,
    }
}
