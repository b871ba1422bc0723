//! Single-sourced shutdown.
//!
//! Every failure path in the daemon funnels into one exit promise and one
//! cleanup procedure. The promise is a [`CancellationToken`]: delivering
//! it twice is naturally a no-op. The cleanup is guarded by a gate mutex
//! and a boolean latch so concurrent callers either wait for the cleanup
//! in flight or return immediately once it has run.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

type KillFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type KillFn = Box<dyn Fn() -> KillFuture + Send + Sync>;

pub struct SafeExit {
    shutdown: CancellationToken,
    gate: Mutex<()>,
    done: AtomicBool,
    children: Mutex<Vec<(String, KillFn)>>,
}

impl SafeExit {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            gate: Mutex::new(()),
            done: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        }
    }

    /// The exit promise. Any task may cancel it to request shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_exit(&self) {
        self.shutdown.cancel();
    }

    /// Register a child's termination routine. The orchestrator registers
    /// each supervisor as it boots; cleanup drains the list.
    pub async fn register<F, Fut>(&self, name: &str, kill: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: KillFn = Box::new(move || Box::pin(kill()) as KillFuture);
        self.children.lock().await.push((name.to_string(), boxed));
    }

    /// Run the cleanup procedure at most once. Returns whether this call
    /// was the one that performed it.
    pub async fn cleanup(&self) -> bool {
        let _gate = self.gate.lock().await;
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }

        let children = std::mem::take(&mut *self.children.lock().await);
        if !children.is_empty() {
            info!(count = children.len(), "terminating children");
            let mut set = JoinSet::new();
            for (name, kill) in children {
                set.spawn(async move {
                    info!(child = %name, "cleanup: terminating");
                    kill().await;
                });
            }
            while set.join_next().await.is_some() {}
        }
        info!("cleanup complete");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn cleanup_runs_registered_kills_in_parallel() {
        let exit = Arc::new(SafeExit::new());
        let counter = Arc::new(AtomicUsize::new(0));
        for name in ["one", "two", "three"] {
            let counter = counter.clone();
            exit.register(name, move || {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }

        let started = tokio::time::Instant::now();
        assert!(exit.cleanup().await);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // Three 50ms kills overlapping, not chained.
        assert!(started.elapsed() < Duration::from_millis(140));
    }

    #[tokio::test]
    async fn concurrent_cleanups_run_the_procedure_once() {
        let exit = Arc::new(SafeExit::new());
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            exit.register("only", move || {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let exit = exit.clone();
            set.spawn(async move { exit.cleanup().await });
        }
        let mut performed = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exit_promise_is_idempotent() {
        let exit = SafeExit::new();
        let token = exit.shutdown_token();
        exit.request_exit();
        exit.request_exit();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
