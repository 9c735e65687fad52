//! Coordinator: fleet aggregation, command dispatch and summary publishing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::command::{AckRecord, CommandDispatcher, CommandError, CommandKind, PendingCommand, ResendSummary};
use crate::config::{ConfigError, DeviceConfig, NodeSettings};
use crate::identity::DeviceId;
use crate::queue::{
    Drained, MessageQueue, QueueError, QueueName, ALARM_IN, CONFIG_ACK_IN, DAILY_IN, TELEMETRY_IN,
    VIEWER_SUMMARY_OUT,
};
use crate::recovery::RecoveryManager;
use crate::relay::Relay;
use crate::report::{AlarmKind, AlarmReport, DailyReport, FleetSummary, TankRecord, TelemetryReport};
use crate::storage::{files, AtomicStore, ReportLedger, StoreError};
use crate::time::{wake_delay, Cadence, ClockSync, Epoch, HourTicks, TaskTable, Uptime};
use crate::watchdog::Watchdog;

use super::{ControlLoop, FleetRecords};

const SUMMARY_KIND: &str = "summary";

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorTask {
    Drain,
    Resend,
    Summary,
    Persist,
    Heartbeat,
}

/// What one pass over the inbound queues found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub telemetry: usize,
    pub alarms: usize,
    pub daily: usize,
    pub acks: usize,
    /// Records created or changed.
    pub changed: usize,
    /// Bodies that failed to decode.
    pub rejected: usize,
    /// Queues whose drain failed or was cut short by the relay.
    pub failed: usize,
}

pub struct Coordinator {
    id: DeviceId,
    clock: ClockSync,
    queue: MessageQueue,
    store: AtomicStore,
    recovery: RecoveryManager,
    records: FleetRecords,
    ledger: ReportLedger,
    dispatcher: CommandDispatcher,
    tasks: TaskTable<CoordinatorTask>,
    ticks: HourTicks,
    uptime: Arc<dyn Uptime>,
    watchdog: Arc<dyn Watchdog>,
    stale_after_secs: i64,
}

impl Coordinator {
    pub async fn boot(
        settings: &NodeSettings,
        relay: Arc<dyn Relay>,
        store: AtomicStore,
        uptime: Arc<dyn Uptime>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<Self, CoordinatorError> {
        settings.validate()?;
        let id = DeviceId::new(settings.device_id.clone());
        let mut clock = ClockSync::new(relay.clone(), uptime.clone(), settings.time_sync_interval())
            .with_request_timeout(settings.relay_timeout());
        clock.ensure_synced(true).await;
        let now = clock.current_epoch();

        let mut recovery = RecoveryManager::new(store.clone(), settings.heartbeat_interval_secs);
        let outcome = recovery.boot::<TankRecord>(now)?;
        if let Some(notice) = &outcome.notice {
            log::warn!(
                "Coordinator recovered: {:?}, {} records restored, down {}",
                notice.cause,
                notice.records_restored,
                notice
                    .downtime_secs
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "for an unknown time".to_string())
            );
        }
        // No upstream to report to: the log line above is the notice.
        recovery.clear_notices()?;

        let queue = MessageQueue::new(relay).with_timeout(settings.relay_timeout());
        let mut dispatcher = CommandDispatcher::new(queue.clone(), store.clone())
            .with_retry(settings.command_retry_secs, settings.command_max_attempts);
        if let Err(e) = dispatcher.load() {
            log::warn!("Pending commands unreadable, starting empty: {}", e);
        }
        recovery.mark_running()?;

        let mut coordinator = Self {
            id,
            clock,
            queue,
            store,
            recovery,
            records: FleetRecords::from_backup(outcome.records, settings.max_records),
            ledger: outcome.ledger,
            dispatcher,
            tasks: TaskTable::new(),
            ticks: HourTicks::new(),
            uptime,
            watchdog,
            stale_after_secs: settings.stale_after_secs,
        };
        coordinator.schedule(settings);
        log::info!(
            "Coordinator {} up ({} records, {} pending commands, clock {})",
            coordinator.id,
            coordinator.records.len(),
            coordinator.dispatcher.pending().len(),
            now
        );
        Ok(coordinator)
    }

    fn schedule(&mut self, settings: &NodeSettings) {
        let hours = |secs: i64| Some((secs.saturating_add(3_599) / 3_600).max(1) as u64);
        let drain = settings.drain_interval_secs;
        self.tasks
            .insert(CoordinatorTask::Drain, Cadence::Every { secs: drain }, hours(drain))
            .insert(CoordinatorTask::Resend, Cadence::Every { secs: drain }, None)
            .insert(CoordinatorTask::Summary, Cadence::Aligned(settings.summary_schedule()), None)
            .insert(
                CoordinatorTask::Persist,
                Cadence::Every {
                    secs: settings.persist_interval_secs,
                },
                hours(settings.persist_interval_secs),
            )
            .insert(
                CoordinatorTask::Heartbeat,
                Cadence::Every {
                    secs: settings.heartbeat_interval_secs,
                },
                hours(settings.heartbeat_interval_secs),
            );
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn now(&self) -> Epoch {
        self.clock.current_epoch()
    }

    pub fn records(&self) -> &FleetRecords {
        &self.records
    }

    pub fn pending_commands(&self) -> &[PendingCommand] {
        self.dispatcher.pending()
    }

    pub fn ledger(&self) -> &ReportLedger {
        &self.ledger
    }

    /// Fleet snapshot at the current clock, stale flags set.
    pub fn snapshot(&self) -> Vec<TankRecord> {
        self.records.snapshot(self.now(), self.stale_after_secs)
    }

    pub fn snapshot_for(&self, client: Option<&DeviceId>) -> Vec<TankRecord> {
        let mut snapshot = self.snapshot();
        if let Some(client) = client {
            snapshot.retain(|r| &r.client == client);
        }
        snapshot
    }

    /// Drain every inbound queue once and fold the reports into the
    /// record table. Relay failures are logged and counted, never raised.
    pub async fn drain_inbound(&mut self) -> DrainSummary {
        let mut summary = DrainSummary::default();

        if let Some(drained) = Self::take::<TelemetryReport>(&self.queue, TELEMETRY_IN, &mut summary).await {
            for message in drained.messages {
                let mut report = message.body;
                if !report.epoch.is_known() {
                    report.epoch = message.enqueued;
                }
                summary.telemetry += 1;
                if self.records.apply_telemetry(&report) {
                    summary.changed += 1;
                }
            }
        }

        if let Some(drained) = Self::take::<AlarmReport>(&self.queue, ALARM_IN, &mut summary).await {
            for message in drained.messages {
                let mut report = message.body;
                if !report.epoch.is_known() {
                    report.epoch = message.enqueued;
                }
                summary.alarms += 1;
                if let AlarmKind::Recovery(notice) = &report.alarm {
                    log::warn!(
                        "{} at {} recovered from {:?} ({} records restored)",
                        report.client,
                        report.site,
                        notice.cause,
                        notice.records_restored
                    );
                    continue;
                }
                if report.alarm.is_active() {
                    log::warn!(
                        "{} tank {} {} alarm at {:.1} in",
                        report.client,
                        report.tank,
                        report.alarm.label(),
                        report.level
                    );
                }
                if self.records.apply_alarm(&report) {
                    summary.changed += 1;
                }
            }
        }

        if let Some(drained) = Self::take::<DailyReport>(&self.queue, DAILY_IN, &mut summary).await {
            for message in drained.messages {
                let mut report = message.body;
                if !report.epoch.is_known() {
                    report.epoch = message.enqueued;
                }
                summary.daily += 1;
                summary.changed += self.records.apply_daily(&report);
            }
        }

        if let Some(drained) = Self::take::<AckRecord>(&self.queue, CONFIG_ACK_IN, &mut summary).await {
            for ack in drained.bodies() {
                summary.acks += 1;
                if self.dispatcher.acknowledge(&ack).is_none() {
                    log::debug!("Ack for unknown or settled command {}", ack.command_id);
                }
            }
        }

        if summary.changed > 0 {
            log::info!("Drain updated {} records", summary.changed);
        }
        summary
    }

    async fn take<T: serde::de::DeserializeOwned>(
        messages: &MessageQueue,
        queue: QueueName,
        summary: &mut DrainSummary,
    ) -> Option<Drained<T>> {
        match messages.drain::<T>(queue).await {
            Ok(drained) => {
                summary.rejected += drained.rejected;
                if let Some(e) = &drained.interrupted {
                    log::debug!("Drain of {} cut short: {}", queue, e);
                    summary.failed += 1;
                }
                Some(drained)
            }
            Err(e) => {
                log::debug!("Drain of {} failed: {}", queue, e);
                summary.failed += 1;
                None
            }
        }
    }

    /// Drain now and return the refreshed snapshot, optionally for one client.
    pub async fn refresh(&mut self, client: Option<&DeviceId>) -> Vec<TankRecord> {
        self.drain_inbound().await;
        self.snapshot_for(client)
    }

    pub async fn send_command(&mut self, target: DeviceId, kind: CommandKind) -> Result<Uuid, CoordinatorError> {
        let now = self.now();
        Ok(self.dispatcher.send_command(target, kind, now).await?)
    }

    /// Push a config. A config without an `updated` stamp is stamped with
    /// the current time so devices order it after what they hold.
    pub async fn push_config(&mut self, target: DeviceId, mut config: DeviceConfig) -> Result<Uuid, CoordinatorError> {
        if !config.updated.is_known() {
            config.updated = self.now();
        }
        self.send_command(target, CommandKind::ConfigPush(config)).await
    }

    pub async fn resend_due(&mut self) -> ResendSummary {
        let now = self.now();
        self.dispatcher.resend_due(now).await
    }

    /// Publish the fleet summary for `slot` unless already published.
    pub async fn publish_summary(&mut self, now: Epoch, slot: Epoch) -> Result<bool, CoordinatorError> {
        if !now.is_known() {
            log::debug!("Summary skipped, clock unknown");
            return Ok(false);
        }
        if self.ledger.already_sent(SUMMARY_KIND, slot) {
            return Ok(false);
        }
        let summary = FleetSummary {
            generated: now,
            tanks: self.records.snapshot(now, self.stale_after_secs),
        };
        self.queue.enqueue(VIEWER_SUMMARY_OUT, &summary).await?;
        self.ledger.mark_sent(SUMMARY_KIND, slot);
        self.ledger.save(&self.store)?;
        log::info!("Published fleet summary ({} tanks)", summary.tanks.len());
        Ok(true)
    }

    pub fn persist(&mut self) -> Result<(), CoordinatorError> {
        self.store.write_lines(files::RECORDS_BACKUP, self.records.records())?;
        self.ledger.save(&self.store)?;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), CoordinatorError> {
        self.persist()?;
        self.recovery.shutdown()?;
        Ok(())
    }

    pub async fn step(&mut self) -> Vec<CoordinatorTask> {
        self.watchdog.kick();
        self.ticks.observe_uptime(self.uptime.uptime());
        self.clock.ensure_synced(false).await;
        let now = self.now();

        let due: Vec<(CoordinatorTask, Epoch)> = if now.is_known() {
            self.tasks.due_slots(now)
        } else {
            self.tasks
                .due_by_ticks(self.ticks.hours())
                .into_iter()
                .map(|t| (t, now))
                .collect()
        };

        let mut ran = Vec::with_capacity(due.len());
        for (task, slot) in due {
            let result = match task {
                CoordinatorTask::Drain => {
                    self.drain_inbound().await;
                    Ok(())
                }
                CoordinatorTask::Resend => {
                    self.resend_due().await;
                    Ok(())
                }
                CoordinatorTask::Summary => self.publish_summary(now, slot).await.map(|_| ()),
                CoordinatorTask::Persist => self.persist(),
                CoordinatorTask::Heartbeat if !now.is_known() => Ok(()),
                CoordinatorTask::Heartbeat => self
                    .recovery
                    .beat(now, self.uptime.uptime())
                    .map_err(CoordinatorError::from),
            };
            if let Err(e) = result {
                log::warn!("Task {:?} failed: {}", task, e);
            }
            ran.push(task);
        }
        ran
    }

    pub fn next_delay(&self, max: Duration) -> Duration {
        wake_delay(self.now(), self.tasks.next_wake(), max)
    }
}

#[async_trait]
impl ControlLoop for Coordinator {
    async fn step(&mut self) -> usize {
        Coordinator::step(self).await.len()
    }

    fn next_delay(&self, max: Duration) -> Duration {
        Coordinator::next_delay(self, max)
    }

    async fn stop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Clean shutdown failed: {}", e);
        }
    }
}

/// Loop over a coordinator shared with the HTTP API. The lock is held for
/// one step at a time.
#[async_trait]
impl ControlLoop for Arc<Mutex<Coordinator>> {
    async fn step(&mut self) -> usize {
        self.lock().await.step().await.len()
    }

    fn next_delay(&self, max: Duration) -> Duration {
        match self.try_lock() {
            Ok(coordinator) => coordinator.next_delay(max),
            Err(_) => max,
        }
    }

    async fn stop(&mut self) {
        if let Err(e) = self.lock().await.shutdown() {
            log::error!("Clean shutdown failed: {}", e);
        }
    }
}
