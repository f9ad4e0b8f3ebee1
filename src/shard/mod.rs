//! Execution cores and cross-core calls.
//!
//! Every core is an OS thread driving its own current-thread tokio runtime.
//! A worker on that runtime drains the core's FIFO job queue and runs each
//! job as a task scoped with the core id, so code can check which core it
//! runs on with [`current_core`] and [`ensure_core`]. Tasks of one core
//! interleave at await points but never run in parallel, and tasks spawned
//! from a core stay on its thread. State owned by one core is reached from
//! another only through [`ShardRuntime::invoke_on`].

use crate::error::{Error, Result};
use crate::types::CoreId;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

tokio::task_local! {
    static CURRENT_CORE: CoreId;
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type Job = Box<dyn FnOnce() -> BoxFuture + Send + 'static>;

/// Core the calling task runs on, if any.
pub fn current_core() -> Option<CoreId> {
    CURRENT_CORE.try_with(|core| *core).ok()
}

/// Owner-identity check for core-affine operations.
pub fn ensure_core(owner: CoreId) -> Result<()> {
    match current_core() {
        Some(core) if core == owner => Ok(()),
        actual => Err(Error::WrongCore {
            expected: owner,
            actual,
        }),
    }
}

/// Run `fut` to completion as if on `core`.
pub async fn run_on<F: Future>(core: CoreId, fut: F) -> F::Output {
    CURRENT_CORE.scope(core, fut).await
}

/// Spawn a task that stays on the calling task's core.
pub fn spawn_here<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_core() {
        Some(core) => tokio::spawn(CURRENT_CORE.scope(core, fut)),
        None => tokio::spawn(fut),
    }
}

/// Set of execution cores.
pub struct ShardRuntime {
    senders: RwLock<Vec<Option<mpsc::UnboundedSender<Job>>>>,
    exited: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl ShardRuntime {
    /// Start one thread per core.
    pub fn start(num_cores: u32) -> Result<Self> {
        let mut senders = Vec::with_capacity(num_cores as usize);
        let mut exited = Vec::with_capacity(num_cores as usize);

        for core in 0..num_cores {
            let (tx, rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Internal(format!("core {} runtime: {}", core, e)))?;
            std::thread::Builder::new()
                .name(format!("core-{}", core))
                .spawn(move || {
                    runtime.block_on(run_worker(core, rx));
                    // Tasks still running on the core are dropped here.
                    drop(runtime);
                    let _ = exit_tx.send(());
                })
                .map_err(|e| Error::Internal(format!("core {} thread: {}", core, e)))?;
            senders.push(Some(tx));
            exited.push(exit_rx);
        }

        info!(num_cores, "Started execution cores");
        Ok(Self {
            senders: RwLock::new(senders),
            exited: Mutex::new(exited),
        })
    }

    pub fn num_cores(&self) -> u32 {
        self.senders.read().len() as u32
    }

    /// Run `f` on `core` and return its output.
    ///
    /// Runs inline when the caller is already on `core`.
    pub async fn invoke_on<F, Fut, T>(&self, core: CoreId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if current_core() == Some(core) {
            return Ok(f().await);
        }

        let (tx, rx) = oneshot::channel();
        self.submit(
            core,
            Box::new(move || -> BoxFuture {
                Box::pin(async move {
                    let _ = tx.send(f().await);
                })
            }),
        )?;
        rx.await.map_err(|_| Error::CoreStopped(core))
    }

    /// Detach `fut` onto `core`.
    pub fn spawn_on<F>(&self, core: CoreId, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(core, Box::new(move || -> BoxFuture { Box::pin(fut) }))
    }

    /// Stop all cores and wait for their threads to wind down. Later
    /// submissions fail with `CoreStopped`. Must not be awaited on a core.
    pub async fn shutdown(&self) {
        for sender in self.senders.write().iter_mut() {
            sender.take();
        }
        let exited: Vec<oneshot::Receiver<()>> = std::mem::take(&mut *self.exited.lock());
        for rx in exited {
            let _ = rx.await;
        }
        info!("Execution cores stopped");
    }

    fn submit(&self, core: CoreId, job: Job) -> Result<()> {
        let senders = self.senders.read();
        let slot = senders.get(core as usize).ok_or(Error::UnknownCore(core))?;
        let sender = slot.as_ref().ok_or(Error::CoreStopped(core))?;
        sender.send(job).map_err(|_| Error::CoreStopped(core))
    }
}

impl std::fmt::Debug for ShardRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRuntime")
            .field("num_cores", &self.num_cores())
            .finish()
    }
}

async fn run_worker(core: CoreId, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let fut = CURRENT_CORE.sync_scope(core, job);
        tokio::spawn(CURRENT_CORE.scope(core, fut));
    }
    debug!(core, "Core worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_invoke_on_runs_on_target_core() {
        let runtime = ShardRuntime::start(3).unwrap();
        let core = runtime.invoke_on(2, || async { current_core() }).await.unwrap();
        assert_eq!(core, Some(2));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_core() {
        assert!(matches!(
            ensure_core(0),
            Err(Error::WrongCore {
                expected: 0,
                actual: None
            })
        ));
        assert!(run_on(1, async { ensure_core(1) }).await.is_ok());
        assert!(run_on(1, async { ensure_core(0) }).await.is_err());
    }

    #[tokio::test]
    async fn test_nested_invoke_runs_inline() {
        let runtime = Arc::new(ShardRuntime::start(2).unwrap());
        let inner = runtime.clone();
        let result = runtime
            .invoke_on(1, move || async move {
                inner.invoke_on(1, || async { current_core() }).await
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Some(1));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_here_keeps_core() {
        let handle = run_on(4, async { spawn_here(async { current_core() }) }).await;
        assert_eq!(handle.await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_core_tasks_never_overlap() {
        let runtime = Arc::new(ShardRuntime::start(2).unwrap());
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut calls = Vec::new();
        for _ in 0..16 {
            let runtime = runtime.clone();
            let running = running.clone();
            let overlapped = overlapped.clone();
            calls.push(tokio::spawn(async move {
                runtime
                    .invoke_on(1, move || async move {
                        let thread = std::thread::current().name().map(str::to_owned);
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        // Block the thread so a parallel job would be seen.
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        running.fetch_sub(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        thread
                    })
                    .await
                    .unwrap()
            }));
        }
        for call in calls {
            assert_eq!(call.await.unwrap().as_deref(), Some("core-1"));
        }
        assert!(!overlapped.load(Ordering::SeqCst));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_here_on_core_stays_on_its_thread() {
        let runtime = ShardRuntime::start(2).unwrap();
        let thread = runtime
            .invoke_on(0, || async {
                spawn_here(async { std::thread::current().name().map(str::to_owned) })
                    .await
                    .ok()
                    .flatten()
            })
            .await
            .unwrap();
        assert_eq!(thread.as_deref(), Some("core-0"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_and_stopped_cores() {
        let runtime = ShardRuntime::start(1).unwrap();
        assert!(matches!(
            runtime.invoke_on(5, || async {}).await,
            Err(Error::UnknownCore(5))
        ));

        runtime.shutdown().await;
        assert!(matches!(
            runtime.invoke_on(0, || async {}).await,
            Err(Error::CoreStopped(0))
        ));
    }
}
