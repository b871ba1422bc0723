//! Keep-alive watchdog.
//!
//! The front-end proves it is still alive by sending keep-alive ticks
//! over the control channel. After a startup grace the watcher checks for
//! ticks on a fixed interval; enough consecutive silent intervals means
//! the front-end is gone and the daemon must take every child down with
//! it. Firing is final: the switch cannot be re-armed.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Clone, Copy, Debug)]
pub struct Timings {
    /// No timeout can fire during this window after boot.
    pub startup_grace: Duration,
    /// How often the watcher looks for ticks.
    pub check_interval: Duration,
    /// Consecutive silent checks tolerated before firing.
    pub max_missed: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(40),
            check_interval: Duration::from_secs(10),
            max_missed: 4,
        }
    }
}

pub struct KillSwitch {
    keep_alive_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl KillSwitch {
    /// Arm the watchdog. When it fires it cancels `shutdown` and stops.
    pub fn arm(timings: Timings, shutdown: CancellationToken) -> Self {
        let (keep_alive_tx, mut keep_alive_rx) = mpsc::unbounded_channel::<()>();
        let cancel = CancellationToken::new();

        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timings.startup_grace) => {}
                _ = watcher_cancel.cancelled() => return,
            }

            let mut missed = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(timings.check_interval) => {}
                    _ = watcher_cancel.cancelled() => return,
                }

                let mut ticked = false;
                while keep_alive_rx.try_recv().is_ok() {
                    ticked = true;
                }
                if ticked {
                    missed = 0;
                } else {
                    missed += 1;
                    debug!(missed, "no keep-alive this interval");
                }
                if missed > timings.max_missed {
                    error!("kill switch timed out");
                    shutdown.cancel();
                    return;
                }
            }
        });

        Self {
            keep_alive_tx,
            cancel,
        }
    }

    /// Record one keep-alive tick. Cheap and lock-free; the watcher
    /// drains the queue on its own schedule.
    pub fn keep_alive(&self) {
        let _ = self.keep_alive_tx.send(());
    }

    /// Sender for the control server to push ticks through.
    pub fn sender(&self) -> mpsc::UnboundedSender<()> {
        self.keep_alive_tx.clone()
    }

    /// Stop the watcher without firing. Test hook.
    pub fn deactivate(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Timings {
        Timings {
            startup_grace: Duration::from_millis(20),
            check_interval: Duration::from_millis(20),
            max_missed: 2,
        }
    }

    #[tokio::test]
    async fn fires_after_sustained_silence() {
        let shutdown = CancellationToken::new();
        let _switch = KillSwitch::arm(fast(), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .expect("kill switch should have fired");
    }

    #[tokio::test]
    async fn keep_alives_hold_it_open() {
        let shutdown = CancellationToken::new();
        let switch = KillSwitch::arm(fast(), shutdown.clone());

        let feeder_shutdown = shutdown.clone();
        let sender = switch.sender();
        let feeder = tokio::spawn(async move {
            for _ in 0..30 {
                if feeder_shutdown.is_cancelled() {
                    break;
                }
                let _ = sender.send(());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!shutdown.is_cancelled());
        feeder.await.unwrap();

        // Once the ticks stop, it fires.
        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .expect("kill switch should fire after ticks stop");
    }

    #[tokio::test]
    async fn grace_period_defers_firing() {
        let shutdown = CancellationToken::new();
        let timings = Timings {
            startup_grace: Duration::from_millis(200),
            check_interval: Duration::from_millis(10),
            max_missed: 0,
        };
        let _switch = KillSwitch::arm(timings, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn deactivate_stops_the_watcher() {
        let shutdown = CancellationToken::new();
        let switch = KillSwitch::arm(fast(), shutdown.clone());
        switch.deactivate();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn keep_alive_method_ticks_directly() {
        let shutdown = CancellationToken::new();
        let switch = KillSwitch::arm(fast(), shutdown.clone());
        for _ in 0..20 {
            switch.keep_alive();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!shutdown.is_cancelled());
        switch.deactivate();
    }
}
