use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// A cancellable delayed action.
///
/// Disarming aborts the timer task, so an action whose deadline has not yet
/// passed can never run afterwards. Dropping the watchdog disarms it.
#[derive(Debug, Default)]
pub struct Watchdog {
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the watchdog, replacing any earlier deadline.
    pub fn arm<F, Fut>(&mut self, after: Duration, span: tracing::Span, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        let task = async move {
            tokio::time::sleep(after).await;
            action().await;
        };
        self.handle = Some(tokio::spawn(task.instrument(span)));
    }

    /// Returns `true` if a pending deadline was cancelled.
    pub fn disarm(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() -> std::future::Ready<()> + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        (fired, move || {
            handle.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let (fired, action) = counter();
        let mut watchdog = Watchdog::new();
        watchdog.arm(Duration::from_secs(15), tracing::Span::none(), action);
        assert!(watchdog.is_armed());

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());
        assert!(!watchdog.disarm());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent_and_prevents_firing() {
        let (fired, action) = counter();
        let mut watchdog = Watchdog::new();
        watchdog.arm(Duration::from_secs(1), tracing::Span::none(), action);
        assert!(watchdog.disarm());
        assert!(!watchdog.disarm());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_disarms() {
        let (fired, action) = counter();
        {
            let mut watchdog = Watchdog::new();
            watchdog.arm(Duration::from_secs(1), tracing::Span::none(), action);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
