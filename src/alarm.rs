//! Host-side timers for advertising duration and address rotation.
//!
//! An `Alarm` runs its task on the tokio runtime the owning stack was started
//! on. Scheduling replaces any previously armed task; dropping the alarm
//! cancels it.

use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct Alarm {
    handle: Option<JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        Alarm { handle: None }
    }

    /// Arms a one-shot task fired after `delay`.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        }));
    }

    /// Arms a repeating task fired every `interval` until cancelled.
    pub fn schedule_periodic<F>(&mut self, interval: Duration, task: F)
    where
        F: Fn() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                task();
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired2 = fired.clone();
        alarm.schedule(Duration::from_millis(100), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(99)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired2 = fired.clone();
        alarm.schedule(Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        alarm.cancel();

        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_repeats() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired2 = fired.clone();
        alarm.schedule_periodic(Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(10)).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
