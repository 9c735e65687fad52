//! Field device: sample tanks, report upstream, apply commands

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{
    CommandError, CommandKind, CommandRouter, CommandType, LogPull, ProcessSummary, RelaySet, RelayState,
};
use crate::config::{ConfigError, DeviceConfig, NodeSettings};
use crate::identity::DeviceId;
use crate::queue::{MessageQueue, QueueError, ALARM_OUT, DAILY_OUT, TELEMETRY_OUT};
use crate::recovery::{BootState, RecoveryManager};
use crate::relay::Relay;
use crate::report::{AlarmKind, AlarmReport, DailyReport, TankLevel, TelemetryReport};
use crate::storage::{files, AtomicStore, ReportLedger, StoreError};
use crate::time::{wake_delay, Cadence, ClockSync, DriftPolicy, Epoch, HourTicks, TaskTable, Uptime};
use crate::watchdog::Watchdog;

use super::ControlLoop;

const DAILY_KIND: &str = "daily";
const COMMAND_APPLY: &str = "command_apply";
const MAX_EVENTS: usize = 32;
pub const MAX_RELAY_OUTPUTS: u8 = 4;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Level source for the configured tanks. Acquisition and unit
/// conversion live behind this trait.
pub trait TankSensor: Send {
    /// Level in inches, or `None` if the tank could not be read.
    fn read_level(&mut self, tank: u8) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTask {
    Sample,
    Inbound,
    DailyReport,
    Persist,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TankAlarm {
    #[default]
    None,
    High,
    Low,
}

/// Per-tank mirror, backed up to `records_backup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankState {
    pub tank: u8,
    pub level: Option<f64>,
    /// Level carried by the last telemetry the relay accepted.
    pub last_sent: Option<f64>,
    #[serde(default)]
    pub alarm: TankAlarm,
    pub updated: Epoch,
}

impl TankState {
    fn new(tank: u8) -> Self {
        Self {
            tank,
            level: None,
            last_sent: None,
            alarm: TankAlarm::None,
            updated: Epoch::UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub epoch: Epoch,
    pub message: String,
}

/// The part of a device that commands act on.
pub struct DeviceState {
    pub id: DeviceId,
    store: AtomicStore,
    config: DeviceConfig,
    relay_states: BTreeMap<u8, RelayState>,
    events: VecDeque<DeviceEvent>,
    config_changed: bool,
}

impl DeviceState {
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn relay_states(&self) -> &BTreeMap<u8, RelayState> {
        &self.relay_states
    }

    pub fn events(&self) -> impl Iterator<Item = &DeviceEvent> {
        self.events.iter()
    }

    fn record(&mut self, epoch: Epoch, message: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(DeviceEvent { epoch, message });
    }
}

fn apply_config(state: &mut DeviceState, kind: &CommandKind, now: Epoch) -> Result<Option<String>, CommandError> {
    let CommandKind::ConfigPush(config) = kind else {
        return Err(CommandError::Rejected("expected a config push".to_string()));
    };
    config.validate().map_err(|e| CommandError::Rejected(e.to_string()))?;

    if config.updated <= state.config.updated {
        log::info!(
            "Config from {} is not newer than {}, keeping current",
            config.updated,
            state.config.updated
        );
        let digest = state
            .config
            .digest()
            .map_err(|e| CommandError::SerializationError(e.to_string()))?;
        return Ok(Some(digest));
    }

    state.store.write_json(files::DEVICE_CONFIG, config)?;
    let digest = config
        .digest()
        .map_err(|e| CommandError::SerializationError(e.to_string()))?;
    state.config = config.clone();
    state.config_changed = true;
    state.record(now, format!("config applied ({})", config.updated));
    Ok(Some(digest))
}

fn set_relay(state: &mut DeviceState, kind: &CommandKind, now: Epoch) -> Result<Option<String>, CommandError> {
    let CommandKind::RelaySet(RelaySet { output, state: target }) = kind else {
        return Err(CommandError::Rejected("expected a relay command".to_string()));
    };
    if *output == 0 || *output > MAX_RELAY_OUTPUTS {
        return Err(CommandError::Rejected(format!("no relay output {}", output)));
    }
    if state.relay_states.get(output) == Some(target) {
        return Ok(None);
    }

    let mut next = state.relay_states.clone();
    next.insert(*output, *target);
    state.store.write_json(files::RELAY_STATES, &next)?;
    state.relay_states = next;
    state.record(now, format!("relay {} set {:?}", output, target));
    Ok(None)
}

fn pull_log(state: &mut DeviceState, kind: &CommandKind, _now: Epoch) -> Result<Option<String>, CommandError> {
    let CommandKind::LogPull(LogPull { since }) = kind else {
        return Err(CommandError::Rejected("expected a log pull".to_string()));
    };
    let entries: Vec<&DeviceEvent> = state.events.iter().filter(|e| e.epoch >= *since).collect();
    serde_json::to_string(&entries)
        .map(Some)
        .map_err(|e| CommandError::SerializationError(e.to_string()))
}

fn report_location(state: &mut DeviceState, _kind: &CommandKind, _now: Epoch) -> Result<Option<String>, CommandError> {
    let location = state
        .config
        .location
        .ok_or_else(|| CommandError::Rejected("no location configured".to_string()))?;
    serde_json::to_string(&location)
        .map(Some)
        .map_err(|e| CommandError::SerializationError(e.to_string()))
}

pub struct Device {
    state: DeviceState,
    router: CommandRouter<DeviceState>,
    sensor: Box<dyn TankSensor>,
    clock: ClockSync,
    queue: MessageQueue,
    recovery: RecoveryManager,
    ledger: ReportLedger,
    tanks: Vec<TankState>,
    tasks: TaskTable<DeviceTask>,
    ticks: HourTicks,
    uptime: Arc<dyn Uptime>,
    watchdog: Arc<dyn Watchdog>,
    site: String,
    persist_interval_secs: i64,
    heartbeat_interval_secs: i64,
    drift: DriftPolicy,
}

impl Device {
    /// Bring a device up: sync the clock if possible, run recovery, load
    /// config, send the recovery notice, then mark the process running.
    pub async fn boot(
        settings: &NodeSettings,
        relay: Arc<dyn Relay>,
        store: AtomicStore,
        sensor: Box<dyn TankSensor>,
        uptime: Arc<dyn Uptime>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<Self, DeviceError> {
        settings.validate()?;
        let id = DeviceId::new(settings.device_id.clone());
        let mut clock = ClockSync::new(relay.clone(), uptime.clone(), settings.time_sync_interval())
            .with_request_timeout(settings.relay_timeout());
        clock.ensure_synced(true).await;
        let now = clock.current_epoch();

        let mut recovery = RecoveryManager::new(store.clone(), settings.heartbeat_interval_secs);
        let outcome = recovery.boot::<TankState>(now)?;

        let config = match store.load_json::<DeviceConfig>(files::DEVICE_CONFIG) {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::default(),
            Err(e) => {
                log::warn!("Stored config unreadable, using defaults: {}", e);
                DeviceConfig::default()
            }
        };
        let relay_states = match store.load_json::<BTreeMap<u8, RelayState>>(files::RELAY_STATES) {
            Ok(states) => states.unwrap_or_default(),
            Err(e) => {
                log::warn!("Stored relay states unreadable: {}", e);
                BTreeMap::new()
            }
        };

        let queue = MessageQueue::new(relay).with_timeout(settings.relay_timeout());
        let site = if config.site.is_empty() {
            settings.site.clone()
        } else {
            config.site.clone()
        };

        recovery.flush_notices(&queue, &id, &site, now).await?;
        recovery.mark_running()?;

        let mut router = CommandRouter::new(id.clone());
        router
            .register(CommandType::ConfigPush, apply_config)
            .register(CommandType::RelaySet, set_relay)
            .register(CommandType::LogPull, pull_log)
            .register(CommandType::LocationRequest, report_location);

        let mut state = DeviceState {
            id,
            store,
            config,
            relay_states,
            events: VecDeque::new(),
            config_changed: false,
        };
        if outcome.state == BootState::Recovering {
            state.record(now, "recovered from unclean shutdown".to_string());
        }

        let mut device = Self {
            tanks: Vec::new(),
            state,
            router,
            sensor,
            clock,
            queue,
            recovery,
            ledger: outcome.ledger,
            tasks: TaskTable::new(),
            ticks: HourTicks::new(),
            uptime,
            watchdog,
            site,
            persist_interval_secs: settings.persist_interval_secs,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            drift: settings.drift_policy,
        };
        device.sync_tanks(outcome.records);
        device.rebuild_tasks();
        log::info!(
            "Device {} up ({} tanks, clock {})",
            device.state.id,
            device.tanks.len(),
            now
        );
        Ok(device)
    }

    pub fn id(&self) -> &DeviceId {
        &self.state.id
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.state.config
    }

    pub fn tanks(&self) -> &[TankState] {
        &self.tanks
    }

    pub fn ledger(&self) -> &ReportLedger {
        &self.ledger
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn tasks(&self) -> &TaskTable<DeviceTask> {
        &self.tasks
    }

    /// Keep one state per configured tank, reusing restored or existing ones.
    fn sync_tanks(&mut self, mut restored: Vec<TankState>) {
        restored.extend(std::mem::take(&mut self.tanks));
        self.tanks = self
            .state
            .config
            .tanks
            .iter()
            .map(|t| {
                restored
                    .iter()
                    .filter(|s| s.tank == t.number)
                    .max_by_key(|s| s.updated)
                    .cloned()
                    .unwrap_or_else(|| TankState::new(t.number))
            })
            .collect();
    }

    fn rebuild_tasks(&mut self) {
        let config = &self.state.config;
        let every = |secs: i64| Cadence::Every { secs };
        let hours = |secs: i64| Some((secs.saturating_add(3_599) / 3_600).max(1) as u64);

        self.tasks = TaskTable::new();
        self.tasks
            .insert(DeviceTask::Sample, every(config.sample_interval_secs), hours(config.sample_interval_secs))
            .insert(
                DeviceTask::Inbound,
                every(config.inbound_interval_secs()),
                hours(config.inbound_interval_secs()),
            )
            .insert(
                DeviceTask::DailyReport,
                Cadence::Aligned(config.report_schedule().with_drift(self.drift)),
                None,
            )
            .insert(DeviceTask::Persist, every(self.persist_interval_secs), hours(self.persist_interval_secs))
            .insert(
                DeviceTask::Heartbeat,
                every(self.heartbeat_interval_secs),
                hours(self.heartbeat_interval_secs),
            );
    }

    /// One loop iteration. Task failures are logged and retried on the
    /// task's next slot.
    pub async fn step(&mut self) -> Vec<DeviceTask> {
        self.watchdog.kick();
        self.ticks.observe_uptime(self.uptime.uptime());
        self.clock.ensure_synced(false).await;
        let now = self.clock.current_epoch();

        let due: Vec<(DeviceTask, Epoch)> = if now.is_known() {
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
                DeviceTask::Sample => self.sample(now).await,
                DeviceTask::Inbound => self.process_inbound(now).await.map(|_| ()),
                DeviceTask::DailyReport => self.send_daily_report(now, slot).await.map(|_| ()),
                DeviceTask::Persist => self.persist(),
                // An unknown epoch would overwrite the last known heartbeat.
                DeviceTask::Heartbeat if !now.is_known() => Ok(()),
                DeviceTask::Heartbeat => self
                    .recovery
                    .beat(now, self.uptime.uptime())
                    .map_err(DeviceError::from),
            };
            if let Err(e) = result {
                log::warn!("Task {:?} failed: {}", task, e);
            }
            ran.push(task);
        }
        ran
    }

    /// Read every tank, send telemetry past the change threshold and alarms
    /// on state changes.
    pub async fn sample(&mut self, now: Epoch) -> Result<(), DeviceError> {
        if !self.recovery.pending_notices().is_empty() {
            self.recovery
                .flush_notices(&self.queue, &self.state.id, &self.site, now)
                .await?;
        }

        let threshold = self.state.config.level_change_threshold;
        for index in 0..self.tanks.len() {
            let tank = self.tanks[index].tank;
            let Some(level) = self.sensor.read_level(tank) else {
                log::warn!("Tank {} could not be read", tank);
                continue;
            };
            let label = self
                .state
                .config
                .tank(tank)
                .map(|t| t.label.clone())
                .unwrap_or_default();
            let limits = self
                .state
                .config
                .tank(tank)
                .map(|t| (t.low_alarm, t.high_alarm))
                .unwrap_or((None, None));

            {
                let state = &mut self.tanks[index];
                state.level = Some(level);
                state.updated = now;
            }

            let changed = match self.tanks[index].last_sent {
                None => true,
                Some(sent) => (level - sent).abs() >= threshold,
            };
            if changed {
                let report = TelemetryReport {
                    client: self.state.id.clone(),
                    site: self.site.clone(),
                    tank,
                    label,
                    level,
                    epoch: now,
                };
                match self.queue.enqueue(TELEMETRY_OUT, &report).await {
                    Ok(()) => self.tanks[index].last_sent = Some(level),
                    Err(e) => log::debug!("Telemetry for tank {} not sent: {}", tank, e),
                }
            }

            let alarm = match limits {
                (_, Some(high)) if level >= high => TankAlarm::High,
                (Some(low), _) if level <= low => TankAlarm::Low,
                _ => TankAlarm::None,
            };
            if alarm != self.tanks[index].alarm {
                let kind = match alarm {
                    TankAlarm::High => AlarmKind::High,
                    TankAlarm::Low => AlarmKind::Low,
                    TankAlarm::None => AlarmKind::Clear,
                };
                let report = AlarmReport {
                    client: self.state.id.clone(),
                    site: self.site.clone(),
                    tank,
                    level,
                    epoch: now,
                    alarm: kind,
                };
                match self.queue.enqueue(ALARM_OUT, &report).await {
                    Ok(()) => {
                        log::info!("Tank {} alarm {}", tank, report.alarm.label());
                        self.tanks[index].alarm = alarm;
                        self.state.record(now, format!("tank {} alarm {}", tank, report.alarm.label()));
                    }
                    Err(e) => log::warn!("Alarm for tank {} not sent: {}", tank, e),
                }
            }
        }
        Ok(())
    }

    /// Drain and apply commands inside a tagged operation, so a crash
    /// mid-apply is reported at the next boot.
    pub async fn process_inbound(&mut self, now: Epoch) -> Result<ProcessSummary, DeviceError> {
        self.recovery.begin_operation(COMMAND_APPLY)?;
        let result = self.router.process(&mut self.state, &self.queue, now).await;
        self.recovery.end_operation()?;

        if self.state.config_changed {
            self.state.config_changed = false;
            if !self.state.config.site.is_empty() {
                self.site = self.state.config.site.clone();
            }
            self.sync_tanks(Vec::new());
            self.rebuild_tasks();
            log::info!("Config applied, schedule rebuilt");
        }

        match result {
            Ok(summary) => Ok(summary),
            Err(QueueError::Relay(e)) => {
                log::debug!("Inbound poll skipped: {}", e);
                Ok(ProcessSummary::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send the daily report for `slot` unless one was already sent for it
    /// or for an earlier slot on the same day. Returns whether a report went
    /// out. Skipped while the clock is unknown.
    pub async fn send_daily_report(&mut self, now: Epoch, slot: Epoch) -> Result<bool, DeviceError> {
        let Some(date) = now.date() else {
            log::debug!("Daily report skipped, clock unknown");
            return Ok(false);
        };
        let day = slot.date().unwrap_or(date);
        if self.ledger.already_sent(DAILY_KIND, slot) || self.ledger.sent_on(DAILY_KIND, day) {
            log::info!("Daily report for {} already sent", slot);
            return Ok(false);
        }

        let report = DailyReport {
            client: self.state.id.clone(),
            site: self.site.clone(),
            date,
            epoch: now,
            tanks: self
                .tanks
                .iter()
                .filter_map(|t| t.level.map(|level| TankLevel { tank: t.tank, level }))
                .collect(),
        };
        self.queue.enqueue(DAILY_OUT, &report).await?;
        self.ledger.mark_sent(DAILY_KIND, slot);
        self.ledger.save(&self.state.store)?;
        Ok(true)
    }

    pub fn persist(&mut self) -> Result<(), DeviceError> {
        self.state.store.write_lines(files::RECORDS_BACKUP, &self.tanks)?;
        self.ledger.save(&self.state.store)?;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), DeviceError> {
        self.persist()?;
        self.recovery.shutdown()?;
        Ok(())
    }

    pub fn next_delay(&self, max: Duration) -> Duration {
        wake_delay(self.clock.current_epoch(), self.tasks.next_wake(), max)
    }
}

#[async_trait]
impl ControlLoop for Device {
    async fn step(&mut self) -> usize {
        Device::step(self).await.len()
    }

    fn next_delay(&self, max: Duration) -> Duration {
        Device::next_delay(self, max)
    }

    async fn stop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Clean shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AckRecord, AckStatus, Command};
    use crate::config::TankConfig;
    use crate::queue::{ALARM_IN, CONFIG_ACK_OUT, CONFIG_IN};
    use crate::recovery::RecoveryReason;
    use crate::relay::simulated::{EndpointRole, SimRelayNetwork};
    use crate::time::MonotonicUptime;
    use crate::watchdog::NoopWatchdog;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    // 2025-11-21 04:00:00 UTC
    const START: Epoch = Epoch(1_763_697_600);

    #[derive(Clone, Default)]
    struct FakeSensor(Arc<Mutex<BTreeMap<u8, f64>>>);

    impl FakeSensor {
        fn set(&self, tank: u8, level: f64) {
            self.0.lock().unwrap().insert(tank, level);
        }
    }

    impl TankSensor for FakeSensor {
        fn read_level(&mut self, tank: u8) -> Option<f64> {
            self.0.lock().unwrap().get(&tank).copied()
        }
    }

    struct Fixture {
        dir: TempDir,
        network: Arc<SimRelayNetwork>,
        sensor: FakeSensor,
        settings: NodeSettings,
    }

    impl Fixture {
        fn new() -> Self {
            let network = SimRelayNetwork::new();
            network.set_time(START);
            network.attach(DeviceId::new("dev:server"), EndpointRole::Coordinator);
            let sensor = FakeSensor::default();
            sensor.set(1, 42.5);
            Self {
                dir: tempdir().unwrap(),
                network,
                sensor,
                settings: NodeSettings {
                    device_id: "dev:1".to_string(),
                    site: "North".to_string(),
                    ..NodeSettings::default()
                },
            }
        }

        fn store(&self) -> AtomicStore {
            AtomicStore::open(self.dir.path()).unwrap()
        }

        async fn boot(&self) -> Device {
            let relay = self.network.attach(DeviceId::new("dev:1"), EndpointRole::Device);
            Device::boot(
                &self.settings,
                Arc::new(relay),
                self.store(),
                Box::new(self.sensor.clone()),
                Arc::new(MonotonicUptime::new()),
                Arc::new(NoopWatchdog),
            )
            .await
            .unwrap()
        }

        fn outbound(&self, queue: crate::queue::QueueName) -> Vec<serde_json::Value> {
            self.network.pending_outbound(&DeviceId::new("dev:1"), queue)
        }

        fn push(&self, command: &Command) {
            self.network.inject(
                &DeviceId::new("dev:1"),
                CONFIG_IN,
                serde_json::to_value(command).unwrap(),
            );
        }
    }

    fn with_alarms(low: f64, high: f64) -> DeviceConfig {
        DeviceConfig {
            tanks: vec![TankConfig::new(1, "Diesel").with_alarms(Some(low), Some(high))],
            updated: START,
            ..DeviceConfig::default()
        }
    }

    fn config_command(config: DeviceConfig) -> Command {
        Command::new(DeviceId::new("dev:1"), &CommandKind::ConfigPush(config), START).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_step_samples_and_sends_telemetry() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        assert!(device.clock().is_synced());

        let ran = device.step().await;
        assert!(ran.contains(&DeviceTask::Sample));
        let telemetry = fx.outbound(TELEMETRY_OUT);
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0]["tank"], 1);
        assert_eq!(telemetry[0]["level"], 42.5);
        assert_eq!(telemetry[0]["client"], "dev:1");
        assert_eq!(telemetry[0]["site"], "North");
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_change_threshold() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        fx.push(&config_command(DeviceConfig {
            level_change_threshold: 2.0,
            updated: START,
            ..DeviceConfig::default()
        }));
        device.process_inbound(START).await.unwrap();

        device.sample(START).await.unwrap();
        fx.sensor.set(1, 43.5);
        device.sample(START.plus_secs(1_800)).await.unwrap();
        assert_eq!(fx.outbound(TELEMETRY_OUT).len(), 1);

        fx.sensor.set(1, 45.0);
        device.sample(START.plus_secs(3_600)).await.unwrap();
        assert_eq!(fx.outbound(TELEMETRY_OUT).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarms_are_edge_triggered() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        fx.push(&config_command(with_alarms(10.0, 90.0)));
        device.process_inbound(START).await.unwrap();

        fx.sensor.set(1, 95.0);
        device.sample(START).await.unwrap();
        device.sample(START.plus_secs(60)).await.unwrap();
        let alarms = fx.outbound(ALARM_OUT);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0]["alarm"]["type"], "high");

        fx.sensor.set(1, 50.0);
        device.sample(START.plus_secs(120)).await.unwrap();
        let alarms = fx.outbound(ALARM_OUT);
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[1]["alarm"]["type"], "clear");
        assert_eq!(device.tanks()[0].alarm, TankAlarm::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_is_retried_when_relay_is_down() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        fx.push(&config_command(with_alarms(10.0, 90.0)));
        device.process_inbound(START).await.unwrap();

        fx.sensor.set(1, 5.0);
        fx.network.set_online(false);
        device.sample(START).await.unwrap();
        assert_eq!(device.tanks()[0].alarm, TankAlarm::None);

        fx.network.set_online(true);
        device.sample(START.plus_secs(60)).await.unwrap();
        assert_eq!(device.tanks()[0].alarm, TankAlarm::Low);
        assert_eq!(fx.outbound(ALARM_OUT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_report_is_sent_once_per_slot() {
        let fx = Fixture::new();
        let slot = START.plus_secs(3_600);
        {
            let mut device = fx.boot().await;
            device.sample(slot).await.unwrap();
            assert!(device.send_daily_report(slot, slot).await.unwrap());
            assert!(!device.send_daily_report(slot.plus_secs(5), slot).await.unwrap());
            device.shutdown().unwrap();
        }

        // Survives a reboot.
        let mut device = fx.boot().await;
        assert!(!device.send_daily_report(slot.plus_secs(60), slot).await.unwrap());
        assert_eq!(fx.outbound(DAILY_OUT).len(), 1);
        let daily = &fx.outbound(DAILY_OUT)[0];
        assert_eq!(daily["date"], "2025-11-21");
        assert_eq!(daily["tanks"][0]["level"], 42.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_the_report_hour_does_not_send_twice_a_day() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let early = START.plus_secs(3_600); // 05:00
        device.sample(early).await.unwrap();
        assert!(device.send_daily_report(early, early).await.unwrap());

        fx.push(&config_command(DeviceConfig {
            report_hour: 7,
            updated: START,
            ..DeviceConfig::default()
        }));
        device.process_inbound(early.plus_secs(600)).await.unwrap();
        let later = START.plus_secs(3 * 3_600); // 07:00
        assert_eq!(device.config().report_hour, 7);

        assert!(!device.send_daily_report(later, later).await.unwrap());
        assert_eq!(fx.outbound(DAILY_OUT).len(), 1);

        // The next day goes out as usual.
        let tomorrow = later.plus_secs(86_400);
        assert!(device.send_daily_report(tomorrow, tomorrow).await.unwrap());
        assert_eq!(fx.outbound(DAILY_OUT).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_clock_skips_daily_report_but_still_samples() {
        let fx = Fixture::new();
        fx.network.set_time(Epoch::UNKNOWN);
        let mut device = fx.boot().await;
        assert!(!device.clock().is_synced());

        assert!(!device.send_daily_report(Epoch::UNKNOWN, Epoch::UNKNOWN).await.unwrap());
        let ran = device.step().await;
        assert!(ran.contains(&DeviceTask::Sample));
        assert!(!ran.contains(&DeviceTask::DailyReport));
        assert_eq!(fx.outbound(TELEMETRY_OUT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_push_is_applied_once_and_acked() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let config = DeviceConfig {
            sample_interval_secs: 600,
            site: "South".to_string(),
            updated: START,
            ..DeviceConfig::default()
        };
        let command = config_command(config.clone());
        fx.push(&command);
        fx.push(&command);

        let summary = device.process_inbound(START).await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(device.config(), &config);
        assert_eq!(
            fx.store().read_json::<DeviceConfig>(files::DEVICE_CONFIG).unwrap(),
            config
        );

        let acks: Vec<AckRecord> = fx
            .outbound(CONFIG_ACK_OUT)
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.status == AckStatus::Applied));
        assert!(acks.iter().all(|a| a.detail == Some(config.digest().unwrap())));
        assert_eq!(
            device.state().events().filter(|e| e.message.starts_with("config applied")).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_config_is_a_no_op() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let newer = DeviceConfig {
            level_change_threshold: 3.0,
            updated: START.plus_secs(100),
            ..DeviceConfig::default()
        };
        let older = DeviceConfig {
            level_change_threshold: 1.0,
            updated: START,
            ..DeviceConfig::default()
        };
        fx.push(&config_command(newer.clone()));
        fx.push(&config_command(older));
        device.process_inbound(START).await.unwrap();

        assert_eq!(device.config(), &newer);
        let acks = fx.outbound(CONFIG_ACK_OUT);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1]["status"], "applied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let mut command = config_command(DeviceConfig::default());
        command.payload["reportHour"] = serde_json::json!(30);
        command.payload["updated"] = serde_json::json!(START.0 + 10);
        fx.push(&command);

        device.process_inbound(START).await.unwrap();
        assert_eq!(device.config(), &DeviceConfig::default());
        assert_eq!(fx.outbound(CONFIG_ACK_OUT)[0]["status"], "rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_state_is_set_not_toggled_and_persisted() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let command = Command::new(
            DeviceId::new("dev:1"),
            &CommandKind::RelaySet(RelaySet {
                output: 2,
                state: RelayState::On,
            }),
            START,
        )
        .unwrap();
        fx.push(&command);
        fx.push(&command);
        device.process_inbound(START).await.unwrap();
        assert_eq!(device.state().relay_states().get(&2), Some(&RelayState::On));

        device.shutdown().unwrap();
        let rebooted = fx.boot().await;
        assert_eq!(rebooted.state().relay_states().get(&2), Some(&RelayState::On));
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_and_log_pull_reply_in_detail() {
        let fx = Fixture::new();
        let mut device = fx.boot().await;
        let location = Command::new(DeviceId::new("dev:1"), &CommandKind::LocationRequest, START).unwrap();
        fx.push(&location);
        let pull = Command::new(
            DeviceId::new("dev:1"),
            &CommandKind::LogPull(LogPull { since: Epoch::UNKNOWN }),
            START,
        )
        .unwrap();
        fx.push(&pull);
        device.process_inbound(START).await.unwrap();

        let acks = fx.outbound(CONFIG_ACK_OUT);
        assert_eq!(acks[0]["status"], "rejected");
        assert_eq!(acks[1]["status"], "applied");
        assert!(acks[1]["detail"].as_str().unwrap().starts_with('['));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_mid_apply_is_reported_after_reboot() {
        let fx = Fixture::new();
        {
            let mut device = fx.boot().await;
            device.sample(START).await.unwrap();
            device.persist().unwrap();
            device.recovery.begin_operation(COMMAND_APPLY).unwrap();
            // Dropped without shutdown: power lost mid-apply.
        }
        let server = MessageQueue::new(Arc::new(
            fx.network.attach(DeviceId::new("dev:server"), EndpointRole::Coordinator),
        ));

        let device = fx.boot().await;
        assert_eq!(device.tanks()[0].level, Some(42.5));
        fx.network.sync();
        let alarms = server.drain::<AlarmReport>(ALARM_IN).await.unwrap();
        let recovery: Vec<_> = alarms
            .messages
            .iter()
            .filter_map(|m| match &m.body.alarm {
                AlarmKind::Recovery(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(recovery.len(), 1);
        assert_eq!(recovery[0].records_restored, 1);

        let state = RecoveryManager::new(fx.store(), 300).read_state().unwrap().unwrap();
        assert_eq!(state.reason, RecoveryReason::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_notice_is_resent_once_the_relay_is_back() {
        let fx = Fixture::new();
        {
            let mut device = fx.boot().await;
            device.persist().unwrap();
            // Dropped without shutdown.
        }

        fx.network.set_online(false);
        let mut device = fx.boot().await;
        assert_eq!(device.recovery.pending_notices().len(), 1);
        device.sample(START).await.unwrap();
        assert!(fx.outbound(ALARM_OUT).is_empty());

        fx.network.set_online(true);
        device.sample(START.plus_secs(60)).await.unwrap();
        device.sample(START.plus_secs(120)).await.unwrap();
        let alarms = fx.outbound(ALARM_OUT);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0]["alarm"]["type"], "recovery");
        assert!(device.recovery.pending_notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_clock_keeps_the_last_heartbeat() {
        let fx = Fixture::new();
        {
            let mut device = fx.boot().await;
            device.recovery.beat(START, Duration::from_secs(60)).unwrap();
            device.shutdown().unwrap();
        }

        fx.network.set_time(Epoch::UNKNOWN);
        let mut device = fx.boot().await;
        let ran = device.step().await;
        assert!(ran.contains(&DeviceTask::Heartbeat));
        assert_eq!(device.recovery.heartbeat().last_epoch(), START);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_settings_fail_boot() {
        let fx = Fixture::new();
        let settings = NodeSettings {
            heartbeat_interval_secs: 0,
            ..fx.settings.clone()
        };
        let relay = fx.network.attach(DeviceId::new("dev:1"), EndpointRole::Device);
        let result = Device::boot(
            &settings,
            Arc::new(relay),
            fx.store(),
            Box::new(fx.sensor.clone()),
            Arc::new(MonotonicUptime::new()),
            Arc::new(NoopWatchdog),
        )
        .await;
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_shutdown_sends_no_notice() {
        let fx = Fixture::new();
        {
            let mut device = fx.boot().await;
            device.shutdown().unwrap();
        }
        fx.boot().await;
        assert!(fx.outbound(ALARM_OUT).is_empty());
    }
}
