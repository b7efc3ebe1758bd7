use super::monitor::{SystemUsageSampler, UsageSampler};
use super::types::*;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tolerance for floating point capacity comparisons
const CAPACITY_EPSILON: f64 = 1e-9;

struct QueuedRequest {
    ticket: AllocationId,
    request: ResourceRequest,
    enqueued_at: Instant,
    waiter: Option<oneshot::Sender<AllocationId>>,
}

impl QueuedRequest {
    /// Waiting requesters enforce their own timeout
    fn is_overdue(&self, now: Instant) -> bool {
        let waited_on = self.waiter.as_ref().is_some_and(|w| !w.is_closed());
        !waited_on
            && self
                .enqueued_at
                .checked_add(self.request.timeout)
                .is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
struct ManagerState {
    next_ticket: AllocationId,
    allocations: HashMap<AllocationId, ResourceAllocation>,
    queue: VecDeque<QueuedRequest>,
    history: VecDeque<UsageSample>,
    metrics: ResourceMetrics,
}

impl ManagerState {
    fn allocated(&self, resource_type: ResourceType) -> f64 {
        self.allocations
            .values()
            .filter(|a| a.resource_type == resource_type)
            .map(|a| a.allocated_amount)
            .sum()
    }

    fn is_queued(&self, resource_type: ResourceType) -> bool {
        self.queue
            .iter()
            .any(|q| q.request.resource_type == resource_type)
    }

    fn remove_allocation(&mut self, id: AllocationId) -> Option<ResourceAllocation> {
        let allocation = self.allocations.remove(&id)?;
        self.metrics.released += 1;
        if allocation.usage_samples > 0 {
            self.metrics.released_allocated_total += allocation.allocated_amount;
            self.metrics.released_usage_total += allocation.peak_usage;
        }
        Some(allocation)
    }

    fn grant(&mut self, ticket: AllocationId, request: &ResourceRequest) {
        self.allocations
            .insert(ticket, ResourceAllocation::grant(ticket, request));
        self.metrics.granted += 1;
    }

    /// FIFO with per-type head-of-line blocking: once a request of a type
    /// cannot be served, later requests of that type wait behind it
    fn process_queue(&mut self, config: &ResourceManagerConfig) -> usize {
        let mut blocked: HashSet<ResourceType> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());
        let mut granted = 0;

        while let Some(mut entry) = self.queue.pop_front() {
            let resource_type = entry.request.resource_type;
            let max = config.max_for(resource_type).unwrap_or(0.0);
            let fits = self.allocated(resource_type) + entry.request.amount
                <= max + CAPACITY_EPSILON;

            if blocked.contains(&resource_type) || !fits {
                blocked.insert(resource_type);
                remaining.push_back(entry);
                continue;
            }

            if let Some(waiter) = entry.waiter.take()
                && waiter.send(entry.ticket).is_err()
            {
                // The requester stopped waiting without withdrawing
                self.metrics.abandoned += 1;
                continue;
            }

            self.grant(entry.ticket, &entry.request);
            granted += 1;
            debug!(
                step_key = %entry.request.step_key,
                resource = %resource_type,
                amount = entry.request.amount,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Granted queued resource request"
            );
        }

        self.queue = remaining;
        granted
    }
}

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Admission control and monitoring for shared capacity.
///
/// All limit state sits behind one async mutex; grants, releases and shrinks
/// are serialized through it. The handle is cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    config: Arc<ResourceManagerConfig>,
    state: Arc<Mutex<ManagerState>>,
    alerts: broadcast::Sender<ResourceAlert>,
    sampler: Arc<dyn UsageSampler>,
    monitor: Arc<Mutex<Option<MonitorHandle>>>,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self::with_sampler(config, Arc::new(SystemUsageSampler::new()))
    }

    pub fn with_sampler(config: ResourceManagerConfig, sampler: Arc<dyn UsageSampler>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(ManagerState::default())),
            alerts,
            sampler,
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    fn check_request(&self, request: &ResourceRequest) -> Result<(), ResourceError> {
        let Some(max) = self.config.max_for(request.resource_type) else {
            return Err(ResourceError::UnknownResource(request.resource_type));
        };
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(ResourceError::InvalidAmount(request.amount));
        }
        if request.amount > max + CAPACITY_EPSILON {
            return Err(ResourceError::ExceedsCapacity {
                resource_type: request.resource_type,
                requested: request.amount,
                max,
            });
        }
        Ok(())
    }

    async fn submit(
        &self,
        request: ResourceRequest,
        waiter: Option<oneshot::Sender<AllocationId>>,
    ) -> Result<AllocationOutcome, ResourceError> {
        let mut state = self.state.lock().await;
        if let Err(e) = self.check_request(&request) {
            state.metrics.denied += 1;
            warn!(step_key = %request.step_key, "Resource request denied: {}", e);
            return Err(e);
        }

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let resource_type = request.resource_type;
        let max = self.config.max_for(resource_type).unwrap_or(0.0);

        if !state.is_queued(resource_type)
            && state.allocated(resource_type) + request.amount <= max + CAPACITY_EPSILON
        {
            state.grant(ticket, &request);
            debug!(
                step_key = %request.step_key,
                resource = %resource_type,
                amount = request.amount,
                "Granted resource request"
            );
            return Ok(AllocationOutcome::Granted(ticket));
        }

        let position = state.queue.len();
        info!(
            step_key = %request.step_key,
            resource = %resource_type,
            amount = request.amount,
            allocated = state.allocated(resource_type),
            max,
            position,
            "Resource request queued"
        );
        state.queue.push_back(QueuedRequest {
            ticket,
            request,
            enqueued_at: Instant::now(),
            waiter,
        });
        state.metrics.queued += 1;
        state.metrics.peak_queue_length = state.metrics.peak_queue_length.max(state.queue.len());
        Ok(AllocationOutcome::Queued { ticket, position })
    }

    /// Grant immediately or enqueue without waiting. A queued request is
    /// granted in the background once capacity frees, unless `release` of
    /// its key, `claim` or maintenance after `request.timeout` withdraws it.
    pub async fn try_request(
        &self,
        request: ResourceRequest,
    ) -> Result<AllocationOutcome, ResourceError> {
        self.submit(request, None).await
    }

    /// Grant or wait in the queue for at most `request.timeout`.
    ///
    /// On timeout the queued entry is withdrawn; if the grant raced the
    /// timeout the fresh allocation is released again.
    pub async fn request_resources(
        &self,
        request: ResourceRequest,
    ) -> Result<AllocationId, ResourceError> {
        let (tx, rx) = oneshot::channel();
        let timeout = request.timeout;
        let step_key = request.step_key.clone();
        let resource_type = request.resource_type;

        let ticket = match self.submit(request, Some(tx)).await? {
            AllocationOutcome::Granted(id) => return Ok(id),
            AllocationOutcome::Queued { ticket, .. } => ticket,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(_)) => Err(ResourceError::Withdrawn(step_key)),
            Err(_) => {
                self.abandon(ticket).await;
                warn!(
                    step_key = %step_key,
                    resource = %resource_type,
                    "Resource request timed out"
                );
                Err(ResourceError::Timeout {
                    step_key,
                    resource_type,
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Withdraw a queued ticket, or release it if it was granted meanwhile
    pub async fn abandon(&self, ticket: AllocationId) {
        let mut state = self.state.lock().await;
        if let Some(position) = state.queue.iter().position(|q| q.ticket == ticket) {
            state.queue.remove(position);
            state.metrics.abandoned += 1;
        } else if state.remove_allocation(ticket).is_some() {
            state.metrics.abandoned += 1;
        }
        state.process_queue(&self.config);
    }

    /// Keep `ticket` if it has been granted, otherwise withdraw it from the
    /// queue. Returns whether the ticket holds an allocation.
    pub async fn claim(&self, ticket: AllocationId) -> bool {
        let mut state = self.state.lock().await;
        if state.allocations.contains_key(&ticket) {
            return true;
        }
        if let Some(position) = state.queue.iter().position(|q| q.ticket == ticket) {
            state.queue.remove(position);
            state.metrics.abandoned += 1;
            state.process_queue(&self.config);
        }
        false
    }

    /// Release every allocation owned by `step_key` and withdraw its queued
    /// requests. Returns the number of allocations released; a second call
    /// for the same key releases nothing.
    pub async fn release(&self, step_key: &str) -> usize {
        let mut state = self.state.lock().await;
        let ids: Vec<AllocationId> = state
            .allocations
            .values()
            .filter(|a| a.step_key == step_key)
            .map(|a| a.id)
            .collect();
        for id in &ids {
            state.remove_allocation(*id);
        }

        let before = state.queue.len();
        state.queue.retain(|q| q.request.step_key != step_key);
        let withdrawn = before - state.queue.len();

        let granted = state.process_queue(&self.config);
        if !ids.is_empty() || withdrawn > 0 {
            debug!(
                step_key,
                released = ids.len(),
                withdrawn,
                granted_from_queue = granted,
                "Released resources"
            );
        }
        ids.len()
    }

    /// Record observed usage for the allocations of `step_key`
    pub async fn update_usage(&self, step_key: &str, usage: &HashMap<ResourceType, f64>) {
        let mut state = self.state.lock().await;
        let low_ratio = self.config.low_usage_ratio;
        for allocation in state
            .allocations
            .values_mut()
            .filter(|a| a.step_key == step_key)
        {
            let Some(&value) = usage.get(&allocation.resource_type) else {
                continue;
            };
            allocation.actual_usage = value;
            allocation.peak_usage = allocation.peak_usage.max(value);
            allocation.usage_samples += 1;
            if value < low_ratio * allocation.allocated_amount {
                allocation.low_usage_streak += 1;
            } else {
                allocation.low_usage_streak = 0;
            }
        }
    }

    /// Expire overdue allocations and queued requests, shrink persistently
    /// underused allocations and serve the queue with whatever was freed
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut report = MaintenanceReport::default();

        let before = state.queue.len();
        state.queue.retain(|entry| {
            if !entry.is_overdue(now) {
                return true;
            }
            warn!(
                step_key = %entry.request.step_key,
                resource = %entry.request.resource_type,
                waited_ms = now.saturating_duration_since(entry.enqueued_at).as_millis() as u64,
                "Queued resource request expired"
            );
            false
        });
        report.expired_requests = before - state.queue.len();
        state.metrics.timeout_request += report.expired_requests as u64;

        let expired: Vec<AllocationId> = state
            .allocations
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id)
            .collect();
        for id in expired {
            if let Some(allocation) = state.remove_allocation(id) {
                state.metrics.timeout_allocation += 1;
                report.expired += 1;
                warn!(
                    step_key = %allocation.step_key,
                    resource = %allocation.resource_type,
                    "Allocation expired and was released"
                );
            }
        }

        let min_streak = self.config.low_usage_samples.max(1);
        let mut optimized = 0;
        for allocation in state.allocations.values_mut() {
            if allocation.low_usage_streak < min_streak {
                continue;
            }
            let target = (allocation.usage_floor() * 1.25).min(allocation.allocated_amount);
            if target + CAPACITY_EPSILON < allocation.allocated_amount {
                debug!(
                    step_key = %allocation.step_key,
                    resource = %allocation.resource_type,
                    from = allocation.allocated_amount,
                    to = target,
                    "Shrinking underused allocation"
                );
                allocation.allocated_amount = target;
                optimized += 1;
            }
            allocation.low_usage_streak = 0;
        }
        state.metrics.optimized += optimized as u64;
        report.optimized = optimized;

        report.granted_from_queue = state.process_queue(&self.config);
        report
    }

    /// Halve the most recent low-priority allocation of `resource_type`,
    /// never below its observed usage. Returns the new amount.
    pub async fn shrink_for_pressure(&self, resource_type: ResourceType) -> Option<f64> {
        let mut state = self.state.lock().await;
        let threshold = self.config.low_priority_threshold;
        let allocation = state
            .allocations
            .values_mut()
            .filter(|a| a.resource_type == resource_type && a.priority < threshold)
            .filter(|a| a.usage_floor() + CAPACITY_EPSILON < a.allocated_amount)
            .max_by_key(|a| (a.start_time, a.id))?;

        let target = (allocation.allocated_amount / 2.0).max(allocation.usage_floor());
        if target + CAPACITY_EPSILON >= allocation.allocated_amount {
            return None;
        }
        warn!(
            step_key = %allocation.step_key,
            resource = %resource_type,
            from = allocation.allocated_amount,
            to = target,
            "Shrinking low-priority allocation under resource pressure"
        );
        allocation.allocated_amount = target;
        state.metrics.shrunk += 1;
        state.process_queue(&self.config);
        Some(target)
    }

    /// Sample, record history, publish alerts and react to critical pressure
    pub async fn monitor_tick(&self) {
        let sampled = self.sampler.sample();
        let mut critical = Vec::new();
        {
            let mut state = self.state.lock().await;
            let mut utilization = HashMap::new();
            for resource_type in self.config.configured_types() {
                let max = self.config.max_for(resource_type).unwrap_or(1.0);
                let allocated = state.allocated(resource_type) / max;
                let observed = sampled.get(&resource_type).copied().unwrap_or(0.0);
                let value = allocated.max(observed).clamp(0.0, 1.0);
                utilization.insert(resource_type, value);

                let level = if value > self.config.critical_threshold {
                    Some(AlertLevel::Critical)
                } else if value > self.config.warning_threshold {
                    Some(AlertLevel::Warning)
                } else {
                    None
                };
                if let Some(level) = level {
                    if level == AlertLevel::Critical {
                        critical.push(resource_type);
                    }
                    // No subscribers is fine
                    let _ = self.alerts.send(ResourceAlert {
                        resource_type,
                        level,
                        utilization: value,
                        timestamp: Utc::now(),
                    });
                }
            }

            state.history.push_back(UsageSample {
                timestamp: Utc::now(),
                utilization,
            });
            while state.history.len() > self.config.history_size.max(1) {
                state.history.pop_front();
            }
        }

        for resource_type in critical {
            warn!(resource = %resource_type, "Critical resource utilization");
            self.shrink_for_pressure(resource_type).await;
        }
        self.run_maintenance().await;
    }

    /// Spawn the periodic monitor task; no-op when already running
    pub async fn start_monitoring(&self) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let period = self.config.monitor_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.monitor_tick().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Resource monitor stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "Resource monitor started");
        *slot = Some(MonitorHandle { shutdown, task });
    }

    /// Stop the monitor task and wait for it
    pub async fn shutdown(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                warn!("Resource monitor task ended abnormally: {}", e);
            }
        }
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ResourceAlert> {
        self.alerts.subscribe()
    }

    pub async fn status(&self) -> Vec<ResourceStatus> {
        let state = self.state.lock().await;
        let latest = state.history.back();
        self.config
            .configured_types()
            .into_iter()
            .map(|resource_type| {
                let max_value = self.config.max_for(resource_type).unwrap_or(0.0);
                let allocated = state.allocated(resource_type);
                ResourceStatus {
                    resource_type,
                    max_value,
                    allocated,
                    utilization: if max_value > 0.0 { allocated / max_value } else { 0.0 },
                    sampled_utilization: latest
                        .and_then(|sample| sample.utilization.get(&resource_type).copied()),
                    active_allocations: state
                        .allocations
                        .values()
                        .filter(|a| a.resource_type == resource_type)
                        .count(),
                    queued_requests: state
                        .queue
                        .iter()
                        .filter(|q| q.request.resource_type == resource_type)
                        .count(),
                }
            })
            .collect()
    }

    pub async fn metrics(&self) -> ResourceMetrics {
        self.state.lock().await.metrics.clone()
    }

    pub async fn history(&self) -> Vec<UsageSample> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn allocated(&self, resource_type: ResourceType) -> f64 {
        self.state.lock().await.allocated(resource_type)
    }

    pub async fn allocation(&self, id: AllocationId) -> Option<ResourceAllocation> {
        self.state.lock().await.allocations.get(&id).cloned()
    }

    pub async fn allocations_for(&self, step_key: &str) -> Vec<ResourceAllocation> {
        let state = self.state.lock().await;
        let mut allocations: Vec<ResourceAllocation> = state
            .allocations
            .values()
            .filter(|a| a.step_key == step_key)
            .cloned()
            .collect();
        allocations.sort_by_key(|a| a.id);
        allocations
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.default_request_timeout_ms)
    }
}
