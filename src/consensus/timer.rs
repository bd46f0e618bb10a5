use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::message::Round;

type ExpireFn = Arc<dyn Fn(Round) + Send + Sync>;

/// Resettable round countdown.
///
/// The callback receives the round the timer was armed for, so a consumer can drop an expiry
/// that races with a reset or a stop.
pub struct RoundTimer {
    on_expire: ExpireFn,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl RoundTimer {
    pub fn new(on_expire: impl Fn(Round) + Send + Sync + 'static) -> Self {
        RoundTimer {
            on_expire: Arc::new(on_expire),
            pending: Mutex::new(None),
        }
    }

    /// Cancels any pending expiry and arms a new one for `round`.
    pub fn reset(&self, round: Round, duration: Duration) {
        let on_expire = self.on_expire.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expire(round);
        });
        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn timer() -> (RoundTimer, mpsc::UnboundedReceiver<Round>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = RoundTimer::new(move |round| {
            let _ = tx.send(round);
        });
        (timer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_reset() {
        let (timer, mut rx) = timer();
        timer.reset(1, Duration::from_millis(100));
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.try_recv(), Ok(1));
        assert!(rx.try_recv().is_err());
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_replaces_pending_expiry() {
        let (timer, mut rx) = timer();
        timer.reset(1, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.reset(2, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv(), Ok(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let (timer, mut rx) = timer();
        timer.reset(1, Duration::from_millis(100));
        timer.stop();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.is_running());
    }
}
