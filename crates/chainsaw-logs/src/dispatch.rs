use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use chainsaw_rules::{ListenerId, Listeners, RuleRef};
use chainsaw_types::ArcRecord;

use crate::config::{DispatchConfig, ResponsivenessScale};
use crate::router::{EventBatch, Router};

/// Handle returned by [`DispatchQueue::add_consumer`]
pub type ConsumerId = u64;

/// Receives routed sub-batches from a [`DispatchQueue`]
pub trait BatchConsumer: Send + Sync {
    /// Destination this consumer wants, or `None` for every destination
    fn interested_destination(&self) -> Option<&str> {
        None
    }

    /// Called on the dispatch worker once per destination per cycle
    fn receive_batch(&self, destination: &str, records: &[ArcRecord]);
}

/// Adapts a closure into a [`BatchConsumer`]
pub struct FnConsumer<F> {
    interest: Option<String>,
    callback: F,
}

impl<F> FnConsumer<F>
where
    F: Fn(&str, &[ArcRecord]) + Send + Sync,
{
    pub fn new(interest: Option<String>, callback: F) -> Self {
        Self { interest, callback }
    }
}

impl<F> BatchConsumer for FnConsumer<F>
where
    F: Fn(&str, &[ArcRecord]) + Send + Sync,
{
    fn interested_destination(&self) -> Option<&str> {
        self.interest.as_deref()
    }

    fn receive_batch(&self, destination: &str, records: &[ArcRecord]) {
        (self.callback)(destination, records)
    }
}

struct Shared {
    pending: Mutex<Vec<ArcRecord>>,
    wake: Notify,
    router: RwLock<Router>,
    consumers: RwLock<Vec<(ConsumerId, Arc<dyn BatchConsumer>)>>,
    next_consumer: AtomicU64,
    interval: Mutex<Duration>,
    min_interval: Duration,
    responsiveness: ResponsivenessScale,
    /// Records per second, stored as `f64` bits
    data_rate: AtomicU64,
    rate_listeners: Listeners<f64>,
}

impl Shared {
    fn publish_rate(&self, rate: f64) {
        let previous = f64::from_bits(self.data_rate.swap(rate.to_bits(), Ordering::Relaxed));
        if previous != rate {
            self.rate_listeners.emit(&rate);
        }
    }

    /// Take the pending records once routing is possible
    fn drain(&self) -> Option<Vec<ArcRecord>> {
        if self.router.read().expression().is_none() {
            return None;
        }
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *pending))
        }
    }

    fn deliver(&self, batch: &EventBatch) {
        let consumers = self.consumers.read().clone();
        for (destination, records) in batch.iter() {
            for (id, consumer) in &consumers {
                let wanted = consumer
                    .interested_destination()
                    .is_none_or(|interest| interest == destination);
                if !wanted {
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| {
                    consumer.receive_batch(destination, records)
                }));
                if let Err(panic) = result {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(consumer = id, destination, %reason, "batch consumer panicked");
                }
            }
        }
    }
}

/// Batches records from a producer and routes them to consumers on a
/// background worker.
///
/// `enqueue` only holds the pending-list lock long enough to push. The
/// worker drains the list, routes it with the current [`Router`], delivers
/// each sub-batch to interested consumers and then sleeps for the dispatch
/// interval. A panicking consumer is logged and skipped.
///
/// Must be created inside a tokio runtime.
pub struct DispatchQueue {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    pub fn new(config: DispatchConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
            router: RwLock::new(Router::new(config.routing_expression.clone())),
            consumers: RwLock::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
            interval: Mutex::new(config.effective_interval()),
            min_interval: config.min_interval,
            responsiveness: config.responsiveness,
            data_rate: AtomicU64::new(0f64.to_bits()),
            rate_listeners: Listeners::new(),
        });
        let cancel = CancellationToken::new();

        let task = {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            tokio::spawn(async move { run(shared, cancel).await })
        };

        info!(
            interval_ms = config.effective_interval().as_millis() as u64,
            expression = ?config.routing_expression,
            "dispatch queue started"
        );

        Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Append a record to the pending batch
    pub fn enqueue(&self, record: ArcRecord) {
        self.shared.pending.lock().push(record);
        self.shared.wake.notify_one();
    }

    /// Append several records under one lock hold
    pub fn enqueue_all<I>(&self, records: I)
    where
        I: IntoIterator<Item = ArcRecord>,
    {
        self.shared.pending.lock().extend(records);
        self.shared.wake.notify_one();
    }

    /// Records waiting for the next cycle
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn BatchConsumer>) -> ConsumerId {
        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.shared.consumers.write().push((id, consumer));
        id
    }

    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut consumers = self.shared.consumers.write();
        let before = consumers.len();
        consumers.retain(|(existing, _)| *existing != id);
        consumers.len() != before
    }

    /// Also deliver records accepted by `rule` to the `key` destination
    pub fn register_route(&self, key: impl Into<String>, rule: RuleRef) {
        self.shared.router.write().register_route(key, rule);
    }

    pub fn remove_route(&self, key: &str) -> bool {
        self.shared.router.write().remove_route(key)
    }

    /// Change the routing expression. Applies from the next cycle; `None`
    /// pauses delivery while records keep accumulating.
    pub fn set_routing_expression(&self, expression: Option<String>) {
        debug!(?expression, "routing expression changed");
        self.shared.router.write().set_expression(expression);
        self.shared.wake.notify_one();
    }

    pub fn routing_expression(&self) -> Option<String> {
        self.shared.router.read().expression().map(str::to_string)
    }

    /// Change the pause between cycles, clamped to the configured floor.
    /// Returns the interval actually applied.
    pub fn set_interval(&self, interval: Duration) -> Duration {
        let applied = interval.max(self.shared.min_interval);
        *self.shared.interval.lock() = applied;
        applied
    }

    pub fn interval(&self) -> Duration {
        *self.shared.interval.lock()
    }

    /// Set the interval from a responsiveness level (1 = most responsive).
    /// Returns the interval actually applied.
    pub fn set_responsiveness(&self, level: u32) -> Duration {
        let applied = self.set_interval(self.shared.responsiveness.interval_for(level));
        debug!(level, interval_ms = applied.as_millis() as u64, "responsiveness changed");
        applied
    }

    /// Responsiveness level matching the current interval
    pub fn responsiveness(&self) -> u32 {
        self.shared.responsiveness.level_for(self.interval())
    }

    /// Records per second over the last cycle
    pub fn data_rate(&self) -> f64 {
        f64::from_bits(self.shared.data_rate.load(Ordering::Relaxed))
    }

    /// Subscribe to throughput changes
    pub fn on_rate_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&f64) + Send + Sync + 'static,
    {
        self.shared.rate_listeners.subscribe(callback)
    }

    pub fn remove_rate_listener(&self, id: ListenerId) -> bool {
        self.shared.rate_listeners.unsubscribe(id)
    }

    /// Stop the worker after its current step
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop the worker and wait for it to exit
    pub async fn join(&self) {
        self.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("dispatch worker failed: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let records = loop {
            if let Some(records) = shared.drain() {
                break records;
            }
            shared.publish_rate(0.0);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("dispatch worker stopped");
                    return;
                }
                _ = shared.wake.notified() => {}
            }
        };

        let started = Instant::now();
        let batch = shared.router.read().route(&records);
        trace!(
            records = records.len(),
            destinations = batch.len(),
            "dispatching batch"
        );
        shared.deliver(&batch);

        let interval = *shared.interval.lock();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("dispatch worker stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            records.len() as f64 / elapsed
        } else {
            0.0
        };
        shared.publish_rate(rate);
    }
}
