//! AdapterHandle - wraps AdapterLogic with consistent lifecycle management.
//!
//! Provides automatic retry with exponential backoff + jitter when adapters
//! lose their upstream connection. All retry logic is centralized here —
//! adapters never implement their own reconnect loops (spec.md §7: retries
//! exist only in connect loops).

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{BusEvent, SharedBus};

/// Retry configuration for adapter startup/run.
///
/// Defaults match spec.md §4.3's Snapcast reconnect policy: base 500ms,
/// cap 30s, ±25% jitter. Other adapters (MQTT, KNX) reuse the same shape
/// with their own config values.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Minimum run time before a subsequent failure resets backoff to
    /// `initial_delay` instead of continuing to double.
    pub stable_run_threshold: Duration,
    /// Fraction of the computed delay randomized in both directions
    /// (0.25 => actual sleep is delay * [0.75, 1.25]).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            stable_run_threshold: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

/// Wraps an [`AdapterLogic`] and provides:
/// - Consistent shutdown handling (can't forget it)
/// - Automatic ACK on stop via `AdapterStopped` event
/// - `SystemShuttingDown` event watching
/// - Automatic retry with exponential backoff + jitter
pub struct AdapterHandle<T: AdapterLogic> {
    logic: Arc<T>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl<T: AdapterLogic> AdapterHandle<T> {
    pub fn new(logic: T, bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self {
            logic: Arc::new(logic),
            bus,
            shutdown,
        }
    }

    pub fn name(&self) -> &'static str {
        self.logic.name()
    }

    pub fn logic(&self) -> &Arc<T> {
        &self.logic
    }

    /// Run the adapter once, no retry. Prefer [`Self::run_with_retry`] in
    /// production.
    pub async fn run(self) -> Result<()> {
        let name = self.logic.name();
        info!("starting adapter: {}", name);
        let result = self.run_once().await;
        self.bus.publish(BusEvent::AdapterStopped { adapter: name });
        info!("adapter {} stopped", name);
        result
    }

    /// Run with automatic retry on error. Backoff doubles from
    /// `initial_delay` up to `max_delay`, jittered by `jitter_fraction`, and
    /// resets to `initial_delay` whenever a run lasted at least
    /// `stable_run_threshold` before failing.
    pub async fn run_with_retry(self, config: RetryConfig) -> Result<()> {
        let name = self.logic.name();
        let mut delay = config.initial_delay;

        loop {
            if self.shutdown.is_cancelled() {
                info!("{}: shutdown before attempt", name);
                break;
            }

            info!("{}: starting (next retry delay: {:?})", name, delay);

            let start = Instant::now();
            match self.run_once().await {
                Ok(()) => {
                    info!("{}: clean exit", name);
                    break;
                }
                Err(e) => {
                    let run_duration = start.elapsed();

                    if run_duration >= config.stable_run_threshold {
                        info!(
                            "{}: ran for {:?} before failure, resetting backoff",
                            name, run_duration
                        );
                        delay = config.initial_delay;
                    }

                    warn!("{}: error ({}), retrying in {:?}", name, e, delay);
                    let sleep_for = config.jittered(delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!("{}: shutdown during backoff", name);
                            break;
                        }
                        _ = tokio::time::sleep(sleep_for) => {
                            delay = (delay * 2).min(config.max_delay);
                        }
                    }
                }
            }
        }

        self.bus.publish(BusEvent::AdapterStopped { adapter: name });
        info!("{}: stopped", name);
        Ok(())
    }

    async fn run_once(&self) -> Result<()> {
        let name = self.logic.name();

        if let Err(e) = self.logic.init().await {
            error!("{}: init failed: {}", name, e);
            return Err(e);
        }

        let mut rx = self.bus.subscribe();

        let ctx = AdapterContext {
            bus: self.bus.clone(),
            shutdown: self.shutdown.clone(),
        };

        let result = tokio::select! {
            result = self.logic.run(ctx) => {
                match &result {
                    Ok(()) => info!("{}: completed normally", name),
                    Err(e) => error!("{}: error: {}", name, e),
                }
                result
            }
            _ = async {
                while let Ok(event) = rx.recv().await {
                    if event.is_shutdown() {
                        break;
                    }
                }
            } => {
                info!("{}: stopping due to SystemShuttingDown event", name);
                Ok(())
            }
            _ = self.shutdown.cancelled() => {
                info!("{}: cancelled via token", name);
                Ok(())
            }
        };

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct MockFailingAdapter {
        name: &'static str,
        fail_count: Arc<AtomicUsize>,
        max_failures: usize,
    }

    impl MockFailingAdapter {
        fn new(name: &'static str, max_failures: usize) -> Self {
            Self {
                name,
                fail_count: Arc::new(AtomicUsize::new(0)),
                max_failures,
            }
        }
    }

    #[async_trait]
    impl AdapterLogic for MockFailingAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<()> {
            let count = self.fail_count.fetch_add(1, Ordering::SeqCst);
            if count < self.max_failures {
                Err(anyhow::anyhow!("simulated failure {}", count + 1))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Clone)]
    struct MockSuccessAdapter;

    #[async_trait]
    impl AdapterLogic for MockSuccessAdapter {
        fn name(&self) -> &'static str {
            "mock-success"
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<()> {
            Ok(())
        }
    }

    fn test_bus() -> SharedBus {
        Arc::new(EventBus::new(100))
    }

    #[tokio::test]
    async fn run_with_retry_success_on_first_try() {
        let bus = test_bus();
        let shutdown = CancellationToken::new();
        let handle = AdapterHandle::new(MockSuccessAdapter, bus, shutdown);
        let config = RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100));
        assert!(handle.run_with_retry(config).await.is_ok());
    }

    #[tokio::test]
    async fn run_with_retry_retries_on_failure() {
        let bus = test_bus();
        let shutdown = CancellationToken::new();
        let adapter = MockFailingAdapter::new("mock-failing", 2);
        let attempts = adapter.fail_count.clone();

        let handle = AdapterHandle::new(adapter, bus, shutdown);
        let config = RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100));

        assert!(handle.run_with_retry(config).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_with_retry_shutdown_during_backoff() {
        let bus = test_bus();
        let shutdown = CancellationToken::new();
        let adapter = MockFailingAdapter::new("mock-failing", 100);
        let attempts = adapter.fail_count.clone();

        let shutdown_clone = shutdown.clone();
        let handle = AdapterHandle::new(adapter, bus, shutdown);
        let config = RetryConfig {
            jitter_fraction: 0.0,
            ..RetryConfig::new(Duration::from_secs(10), Duration::from_secs(60))
        };

        let task = tokio::spawn(async move { handle.run_with_retry(config).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_clone.cancel();

        assert!(task.await.unwrap().is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn run_with_retry_shutdown_before_first_attempt() {
        let bus = test_bus();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let adapter = MockFailingAdapter::new("mock-failing", 100);
        let attempts = adapter.fail_count.clone();

        let handle = AdapterHandle::new(adapter, bus, shutdown);
        assert!(handle.run_with_retry(RetryConfig::default()).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retry_config_default_matches_snapcast_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.jitter_fraction, 0.25);
    }

    #[test]
    fn backoff_progression_doubles_and_caps() {
        let mut delay = Duration::from_millis(500);
        let max_delay = Duration::from_secs(30);
        let expected_ms = [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000];
        for expected in expected_ms {
            assert_eq!(delay.as_millis() as u64, expected);
            delay = (delay * 2).min(max_delay);
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = config.jittered(base);
            assert!(jittered >= Duration::from_secs_f64(7.5));
            assert!(jittered <= Duration::from_secs_f64(12.5));
        }
    }

    struct MockTimedAdapter {
        run_durations: Arc<Mutex<Vec<Duration>>>,
        call_count: Arc<AtomicUsize>,
        retry_starts: Arc<Mutex<Vec<Instant>>>,
    }

    impl MockTimedAdapter {
        fn new(durations: Vec<Duration>) -> Self {
            Self {
                run_durations: Arc::new(Mutex::new(durations)),
                call_count: Arc::new(AtomicUsize::new(0)),
                retry_starts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Clone for MockTimedAdapter {
        fn clone(&self) -> Self {
            Self {
                run_durations: self.run_durations.clone(),
                call_count: self.call_count.clone(),
                retry_starts: self.retry_starts.clone(),
            }
        }
    }

    #[async_trait]
    impl AdapterLogic for MockTimedAdapter {
        fn name(&self) -> &'static str {
            "mock-timed"
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<()> {
            let count = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.retry_starts.lock().unwrap().push(Instant::now());

            let duration = {
                let durations = self.run_durations.lock().unwrap();
                durations.get(count).copied()
            };

            if let Some(dur) = duration {
                tokio::time::sleep(dur).await;
                Err(anyhow::anyhow!("simulated failure after {:?}", dur))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn backoff_resets_after_stable_run() {
        let bus = test_bus();
        let shutdown = CancellationToken::new();

        let adapter = MockTimedAdapter::new(vec![
            Duration::from_millis(0),
            Duration::from_millis(60),
        ]);
        let retry_starts = adapter.retry_starts.clone();

        let handle = AdapterHandle::new(adapter, bus, shutdown);
        let config = RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            stable_run_threshold: Duration::from_millis(50),
            jitter_fraction: 0.0,
        };

        let start = Instant::now();
        assert!(handle.run_with_retry(config).await.is_ok());

        let starts = retry_starts.lock().unwrap();
        assert_eq!(starts.len(), 3);

        let gap1 = starts[1].duration_since(starts[0]);
        let gap2 = starts[2].duration_since(starts[1]);

        assert!(gap1 >= Duration::from_millis(8) && gap1 <= Duration::from_millis(25));
        assert!(gap2 >= Duration::from_millis(65) && gap2 <= Duration::from_millis(85));
        assert!(start.elapsed() < Duration::from_millis(150));
    }
}
