use crate::bots::processor::{EventProcessor, ProcessOutcome};
use crate::core::config::RetryConfig;
use crate::storage::StorageBackend;
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 以机器人请求超时为基数的指数退避。
///
/// `delay(n) = min(max_delay, base * 2^(n-1) * (1 + jitter_ratio * u))`，`u` 取自 `[0, 1)`，
/// `base = max(request_timeout_ms, min_base_delay_ms)`。`jitter_ratio < 1` 时
/// 第 `n` 次的抖动延迟不超过第 `n + 1` 次的无抖动延迟，
/// 因此任意随机取值下序列都不递减。
#[derive(Clone)]
pub struct BackoffPolicy {
    min_base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl BackoffPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            min_base_delay_ms: config.min_base_delay_ms.max(1),
            max_delay_ms: config.max_delay_ms.max(1),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 0.99),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn delay_ms(&self, request_timeout_ms: i64, retry_count: i64) -> u64 {
        let base = (request_timeout_ms.max(0) as u64).max(self.min_base_delay_ms) as f64;
        let exponent = (retry_count.max(1) - 1).min(40) as i32;
        let raw = base * 2_f64.powi(exponent);
        let draw: f64 = if self.jitter_ratio > 0.0 {
            self.rng.lock().gen::<f64>()
        } else {
            0.0
        };
        let jittered = raw * (1.0 + self.jitter_ratio * draw);
        jittered.min(self.max_delay_ms as f64).round() as u64
    }

    pub fn compute_retry_at(&self, now: f64, request_timeout_ms: i64, retry_count: i64) -> f64 {
        now + self.delay_ms(request_timeout_ms, retry_count) as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub rearmed: Vec<i64>,
    pub recovered: Vec<i64>,
    pub outcomes: Vec<(i64, ProcessOutcome)>,
}

/// 周期性地把到期的 `failed` 事件重新置为待处理，并交还给处理器。
pub struct RetryScheduler {
    storage: Arc<dyn StorageBackend>,
    processor: Arc<EventProcessor>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        processor: Arc<EventProcessor>,
        config: RetryConfig,
    ) -> Self {
        Self {
            storage,
            processor,
            config,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(100))
    }

    /// 单轮调度：每个重置或恢复的事件派发一次，
    /// 全部完成后才返回。
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(now_ts()).await
    }

    pub async fn tick_at(&self, now: f64) -> Result<TickReport> {
        let limit = self.config.max_batch.max(1);
        let storage = self.storage.clone();
        let due = tokio::task::spawn_blocking(move || storage.list_retryable_bot_events(now, limit))
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))?;

        let mut report = TickReport::default();
        for event in due {
            let storage = self.storage.clone();
            let event_id = event.id;
            // 只有 CAS 成功的实例负责派发，多实例并发时同一事件每轮最多派发一次。
            let rearmed = tokio::task::spawn_blocking(move || storage.rearm_bot_event(event_id, now))
                .await
                .unwrap_or_else(|err| Err(anyhow!(err)))?;
            if rearmed {
                report.rearmed.push(event_id);
            }
        }

        if self.config.stale_pending_s > 0 {
            let storage = self.storage.clone();
            let cutoff = now - self.config.stale_pending_s as f64;
            let stale = tokio::task::spawn_blocking(move || {
                storage.list_stale_pending_bot_events(cutoff, limit)
            })
            .await
            .unwrap_or_else(|err| Err(anyhow!(err)))?;
            report.recovered = stale
                .into_iter()
                .map(|event| event.id)
                .filter(|id| !report.rearmed.contains(id))
                .collect();
        }

        let dispatch: Vec<i64> = report
            .rearmed
            .iter()
            .chain(report.recovered.iter())
            .copied()
            .collect();
        let results = join_all(dispatch.iter().map(|event_id| {
            let processor = self.processor.clone();
            let event_id = *event_id;
            async move { (event_id, processor.process_event(event_id).await) }
        }))
        .await;
        for (event_id, result) in results {
            match result {
                Ok(outcome) => {
                    debug!(event_id, ?outcome, "retry dispatch finished");
                    report.outcomes.push((event_id, outcome));
                }
                Err(err) => error!(event_id, code = err.code(), "retry dispatch failed: {err}"),
            }
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    async fn run(&self, cancel: CancellationToken) {
        if !self.config.worker_enabled {
            info!("retry worker disabled");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "retry worker started"
        );
        loop {
            match self.tick().await {
                Ok(report) if !report.rearmed.is_empty() || !report.recovered.is_empty() => {
                    info!(
                        rearmed = report.rearmed.len(),
                        recovered = report.recovered.len(),
                        "retry tick dispatched events"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("retry tick failed: {err}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll_interval()) => {}
            }
        }
        info!("retry worker stopped");
    }
}

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
