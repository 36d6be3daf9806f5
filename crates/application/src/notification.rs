//! 推送通知分发
//!
//! 接收者在广播时没有确认实时送达的事件会进入这里：先按用户偏好过滤，
//! 再在一个短暂的窗口后交给工作池推送到用户的所有有效设备。
//!
//! 延迟任务和重试任务都放在同一个按到期时间排序的堆里，由单个调度协程
//! 搬运到工作队列。堆与队列合计不超过 `queue_capacity`，超出的任务直接丢弃并计数。

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::NotificationConfig;
use domain::{
    DeviceToken, DeviceTokenId, NotificationCategory, NotificationPayload, UserId,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::Clock;
use crate::message_store::MessageStore;
use crate::push::{PushOutcome, PushProvider};
use crate::repository::{DeviceTokenRepository, PreferenceRepository};
use crate::retry::Backoff;

/// 单个设备推送失败的分类，只在分发内部使用，不会回传给发送者
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// 超时或推送服务暂时不可用，按退避重试
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// 令牌失效，标记后不再重试
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// 一次待推送的任务
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub id: Uuid,
    pub user_id: UserId,
    pub payload: NotificationPayload,
    pub category: NotificationCategory,
    /// 已经执行过的尝试次数
    pub attempt: u32,
    /// 重试时只推送仍未成功的令牌；`None` 表示所有有效令牌
    pub pending_tokens: Option<HashSet<DeviceTokenId>>,
}

impl DispatchJob {
    pub fn new(user_id: UserId, payload: NotificationPayload, category: NotificationCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            payload,
            category,
            attempt: 0,
            pending_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Scheduled,
    DroppedByPreference,
    /// 待处理任务已达 `queue_capacity`
    DroppedQueueFull,
}

/// 单次 `dispatch` 的结果
#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered { devices: usize },
    /// 在推送前用户已经通过实时连接收到或读过
    AlreadySeen,
    DroppedByPreference,
    NoActiveDevices,
    /// 仍有令牌处于暂时失败状态，携带下一次尝试用的任务
    Retry(DispatchJob),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub dropped_by_preference: u64,
    pub dropped_queue_full: u64,
    pub skipped_already_seen: u64,
    pub delivered: u64,
    pub tokens_invalidated: u64,
    pub retries: u64,
    pub permanently_failed: u64,
    /// 停止时仍在等待、未能推送的任务
    pub abandoned_on_shutdown: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped_by_preference: AtomicU64,
    dropped_queue_full: AtomicU64,
    skipped_already_seen: AtomicU64,
    delivered: AtomicU64,
    tokens_invalidated: AtomicU64,
    retries: AtomicU64,
    permanently_failed: AtomicU64,
    abandoned_on_shutdown: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_by_preference: self.dropped_by_preference.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            skipped_already_seen: self.skipped_already_seen.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            tokens_invalidated: self.tokens_invalidated.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
            abandoned_on_shutdown: self.abandoned_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

pub struct DispatcherDependencies {
    pub store: Arc<dyn MessageStore>,
    pub device_tokens: Arc<dyn DeviceTokenRepository>,
    pub preferences: Arc<dyn PreferenceRepository>,
    pub push: Arc<dyn PushProvider>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct DispatchSettings {
    queue_capacity: usize,
    max_attempts: u32,
    push_timeout: Duration,
    dispatch_delay: Duration,
    backoff: Backoff,
}

/// 堆中的一个延迟任务，按 (到期时间, 入堆序号) 排序
struct Delayed {
    due: Instant,
    seq: u64,
    job: DispatchJob,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Schedule {
    heap: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
}

impl Schedule {
    fn push(&mut self, job: DispatchJob, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Delayed { due, seq, job }));
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }
}

/// 通知分发器。可以廉价克隆，所有克隆共享同一个队列与计数器。
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    deps: DispatcherDependencies,
    settings: DispatchSettings,
    schedule: Mutex<Schedule>,
    wake: Notify,
    queue: mpsc::Sender<DispatchJob>,
    receiver: Mutex<mpsc::Receiver<DispatchJob>>,
    counters: Counters,
}

impl NotificationDispatcher {
    pub fn new(deps: DispatcherDependencies, config: &NotificationConfig) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                deps,
                settings: DispatchSettings {
                    queue_capacity: config.queue_capacity,
                    max_attempts: config.max_attempts,
                    push_timeout: config.push_timeout(),
                    dispatch_delay: config.dispatch_delay(),
                    backoff: Backoff::exponential(config.base_backoff(), config.max_backoff()),
                },
                schedule: Mutex::new(Schedule::default()),
                wake: Notify::new(),
                queue,
                receiver: Mutex::new(receiver),
                counters: Counters::default(),
            }),
        }
    }

    /// 按用户偏好过滤后排队。被偏好关闭的类别直接丢弃，不重试。
    pub async fn enqueue(
        &self,
        user_id: UserId,
        payload: NotificationPayload,
        category: NotificationCategory,
    ) -> EnqueueOutcome {
        if !self.category_enabled(user_id, category).await {
            Counters::bump(&self.inner.counters.dropped_by_preference);
            tracing::info!(
                user_id = %user_id,
                category = %category,
                "notification dropped by user preference"
            );
            return EnqueueOutcome::DroppedByPreference;
        }

        let job = DispatchJob::new(user_id, payload, category);
        let job_id = job.id;
        if !self.schedule(job, self.inner.settings.dispatch_delay).await {
            return EnqueueOutcome::DroppedQueueFull;
        }
        Counters::bump(&self.inner.counters.enqueued);
        tracing::debug!(job_id = %job_id, user_id = %user_id, category = %category, "notification scheduled");
        EnqueueOutcome::Scheduled
    }

    /// 执行一次推送尝试
    pub async fn dispatch(&self, mut job: DispatchJob) -> DispatchOutcome {
        job.attempt += 1;
        let deps = &self.inner.deps;

        if let Some(message_id) = job.payload.message_id {
            match deps.store.delivery_state(message_id, job.user_id).await {
                Ok(Some(state)) if state.is_delivered() => {
                    Counters::bump(&self.inner.counters.skipped_already_seen);
                    tracing::debug!(
                        job_id = %job.id,
                        user_id = %job.user_id,
                        message_id = %message_id,
                        "message already seen, push cancelled"
                    );
                    return DispatchOutcome::AlreadySeen;
                }
                Ok(_) => {}
                Err(err) => {
                    // 宁可多推一次也不漏推
                    tracing::warn!(job_id = %job.id, error = %err, "delivery state lookup failed");
                }
            }
        }

        if !self.category_enabled(job.user_id, job.category).await {
            Counters::bump(&self.inner.counters.dropped_by_preference);
            return DispatchOutcome::DroppedByPreference;
        }

        let tokens = match deps.device_tokens.list_active(job.user_id).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "failed to load device tokens");
                return DispatchOutcome::Retry(job);
            }
        };
        let tokens: Vec<DeviceToken> = match &job.pending_tokens {
            Some(pending) => tokens
                .into_iter()
                .filter(|token| pending.contains(&token.id))
                .collect(),
            None => tokens,
        };
        if tokens.is_empty() {
            tracing::info!(job_id = %job.id, user_id = %job.user_id, "no active device tokens");
            return DispatchOutcome::NoActiveDevices;
        }

        let mut delivered = 0;
        let mut pending = HashSet::new();
        for token in &tokens {
            match self.push_one(token, &job.payload).await {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Permanent(reason)) => {
                    Counters::bump(&self.inner.counters.tokens_invalidated);
                    tracing::warn!(
                        user_id = %job.user_id,
                        token_id = %token.id,
                        reason = %reason,
                        "device token rejected by push provider, invalidating"
                    );
                    if let Err(err) = deps.device_tokens.invalidate(token.id, deps.clock.now()).await {
                        tracing::warn!(token_id = %token.id, error = %err, "failed to invalidate device token");
                    }
                }
                Err(DeliveryError::Transient(reason)) => {
                    tracing::debug!(
                        job_id = %job.id,
                        token_id = %token.id,
                        attempt = job.attempt,
                        reason = %reason,
                        "transient push failure"
                    );
                    pending.insert(token.id);
                }
            }
        }

        if !pending.is_empty() {
            job.pending_tokens = Some(pending);
            return DispatchOutcome::Retry(job);
        }
        if delivered == 0 {
            return DispatchOutcome::NoActiveDevices;
        }
        Counters::bump(&self.inner.counters.delivered);
        DispatchOutcome::Delivered { devices: delivered }
    }

    /// 启动调度协程和 `count` 个工作协程，返回的第一个句柄是调度协程
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        let scheduler = {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                tracing::info!("notification scheduler started");
                dispatcher.run_scheduler().await;
                tracing::info!("notification scheduler stopped");
            })
        };
        std::iter::once(scheduler)
            .chain((0..count).map(|worker| {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    tracing::info!(worker, "notification worker started");
                    dispatcher.run_worker().await;
                    tracing::info!(worker, "notification worker stopped");
                })
            }))
            .collect()
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.counters.snapshot()
    }

    /// 清空尚未推送的任务并计入 `abandoned_on_shutdown`。
    ///
    /// 应在调度协程和工作协程结束后调用，返回被放弃的任务数。
    pub async fn shutdown(&self) -> usize {
        let mut abandoned = {
            let mut schedule = self.inner.schedule.lock().await;
            let pending = schedule.heap.len();
            schedule.heap.clear();
            pending
        };
        {
            let mut receiver = self.inner.receiver.lock().await;
            while receiver.try_recv().is_ok() {
                abandoned += 1;
            }
        }
        self.inner
            .counters
            .abandoned_on_shutdown
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        if abandoned > 0 {
            tracing::warn!(abandoned, "notification dispatcher stopped with pending jobs");
        } else {
            tracing::info!("notification dispatcher stopped");
        }
        abandoned
    }

    /// 工作队列中尚未被取走的任务数
    fn queued(&self) -> usize {
        self.inner.queue.max_capacity() - self.inner.queue.capacity()
    }

    async fn run_scheduler(&self) {
        loop {
            let (ready, next_due) = {
                let mut schedule = self.inner.schedule.lock().await;
                match schedule.next_due() {
                    Some(due) if due <= Instant::now() => {
                        (schedule.heap.pop().map(|Reverse(entry)| entry.job), None)
                    }
                    next_due => (None, next_due),
                }
            };

            if let Some(job) = ready {
                // 工作队列满时在这里等待，堆中的任务继续占用容量
                if self.inner.queue.send(job).await.is_err() {
                    break;
                }
                continue;
            }

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.inner.wake.notified() => {}
                    }
                }
                None => self.inner.wake.notified().await,
            }
        }
    }

    async fn run_worker(&self) {
        loop {
            let job = {
                let mut receiver = self.inner.receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else {
                break;
            };
            let outcome = self.dispatch(job).await;
            self.settle(outcome).await;
        }
    }

    async fn settle(&self, outcome: DispatchOutcome) {
        let DispatchOutcome::Retry(job) = outcome else {
            return;
        };
        let settings = &self.inner.settings;
        if job.attempt >= settings.max_attempts {
            Counters::bump(&self.inner.counters.permanently_failed);
            tracing::error!(
                job_id = %job.id,
                user_id = %job.user_id,
                category = %job.category,
                attempts = job.attempt,
                "notification permanently failed after exhausting retries"
            );
            return;
        }
        let delay = settings.backoff.jittered_delay_at(job.attempt);
        let (job_id, attempt) = (job.id, job.attempt);
        if self.schedule(job, delay).await {
            Counters::bump(&self.inner.counters.retries);
            tracing::debug!(job_id = %job_id, attempt, delay_ms = delay.as_millis() as u64, "notification retry scheduled");
        }
    }

    /// 放入延迟堆；待处理任务已满时丢弃并返回 `false`
    async fn schedule(&self, job: DispatchJob, delay: Duration) -> bool {
        let queued = self.queued();
        let mut schedule = self.inner.schedule.lock().await;
        if schedule.heap.len() + queued >= self.inner.settings.queue_capacity {
            drop(schedule);
            Counters::bump(&self.inner.counters.dropped_queue_full);
            tracing::warn!(
                job_id = %job.id,
                user_id = %job.user_id,
                attempt = job.attempt,
                "notification queue full, job dropped"
            );
            return false;
        }
        schedule.push(job, Instant::now() + delay);
        drop(schedule);
        self.inner.wake.notify_one();
        true
    }

    async fn push_one(
        &self,
        token: &DeviceToken,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        let send = self.inner.deps.push.send(&token.token, payload);
        match tokio::time::timeout(self.inner.settings.push_timeout, send).await {
            Ok(PushOutcome::Delivered) => Ok(()),
            Ok(PushOutcome::InvalidToken) => {
                Err(DeliveryError::Permanent("invalid token".into()))
            }
            Ok(PushOutcome::TransientFailure(reason)) => Err(DeliveryError::Transient(reason)),
            Err(_) => Err(DeliveryError::Transient("push timed out".into())),
        }
    }

    async fn category_enabled(&self, user_id: UserId, category: NotificationCategory) -> bool {
        match self.inner.deps.preferences.find(user_id).await {
            Ok(Some(preference)) => preference.allows(category),
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "failed to load notification preference");
                true
            }
        }
    }
}
