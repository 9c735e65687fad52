//! RecoveryManager: classify the previous shutdown and restore backups

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::identity::DeviceId;
use crate::queue::{MessageQueue, ALARM_OUT};
use crate::report::{AlarmKind, AlarmReport};
use crate::storage::{files, AtomicStore, ReportLedger, StoreError, TempRecovery};
use crate::time::Epoch;

use super::{HeartbeatMonitor, RecoveryNotice, RecoveryReason, RecoveryState, SuspectedCause};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Clean,
    Recovering,
}

/// What boot found and restored.
#[derive(Debug)]
pub struct BootOutcome<R> {
    /// How the previous run was classified. The manager itself is back in
    /// [`BootState::Clean`] once boot returns.
    pub state: BootState,
    pub previous: Option<RecoveryState>,
    pub records: Vec<R>,
    pub ledger: ReportLedger,
    pub temporaries: TempRecovery,
    /// Set when the previous run ended uncleanly.
    pub notice: Option<RecoveryNotice>,
}

pub struct RecoveryManager {
    store: AtomicStore,
    heartbeat: HeartbeatMonitor,
    state: BootState,
    /// Notices not yet accepted by the relay, oldest first.
    pending: Vec<RecoveryNotice>,
}

impl RecoveryManager {
    pub fn new(store: AtomicStore, heartbeat_cadence_secs: i64) -> Self {
        Self {
            heartbeat: HeartbeatMonitor::new(store.clone(), heartbeat_cadence_secs),
            store,
            state: BootState::Clean,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Run once at boot, before anything else touches the store or queues.
    ///
    /// Promotes or discards leftover temporaries, classifies the previous
    /// shutdown, restores record backups and report dates, queues the
    /// recovery notice in `pending_notices`, then writes `normal`. `now` may
    /// be unknown; it only feeds the downtime estimate.
    pub fn boot<R: DeserializeOwned>(&mut self, now: Epoch) -> Result<BootOutcome<R>, StoreError> {
        let temporaries = self.store.recover_temporaries()?;
        let previous = self.read_state()?;
        let last_beat = self.heartbeat.load()?;

        let cause = previous.as_ref().and_then(|s| match &s.reason {
            RecoveryReason::Normal => None,
            RecoveryReason::Unknown => Some(SuspectedCause::PowerLoss),
            RecoveryReason::Operation(tag) => Some(SuspectedCause::InterruptedOperation {
                operation: tag.clone(),
            }),
        });
        self.state = if cause.is_some() {
            BootState::Recovering
        } else {
            BootState::Clean
        };
        let recovering = self.state == BootState::Recovering;
        if let Some(cause) = &cause {
            log::warn!("Previous run ended uncleanly ({:?}), restoring from backups", cause);
        }

        let (records, record_skips) = self.restore_records::<R>(recovering);
        let (ledger, ledger_skips) = self.restore_ledger(recovering);

        let last_epoch = last_beat
            .map(|b| b.epoch)
            .filter(|e| e.is_known())
            .or_else(|| previous.as_ref().map(|s| s.heartbeat).filter(|e| e.is_known()));
        let notice = cause.map(|cause| RecoveryNotice {
            cause,
            records_restored: records.len(),
            report_dates_restored: ledger.len(),
            skipped_entries: record_skips + ledger_skips,
            downtime_secs: last_epoch
                .filter(|_| now.is_known())
                .map(|last| now.secs_since(last).max(0)),
        });
        if let Some(notice) = &notice {
            log::info!(
                "Restored {} records and {} report dates ({} entries skipped)",
                notice.records_restored,
                notice.report_dates_restored,
                notice.skipped_entries
            );
        }

        self.pending = self.load_pending();
        if let Some(notice) = &notice {
            self.pending.push(notice.clone());
            self.save_pending()?;
        }

        let outcome_state = self.state;
        self.write_state(RecoveryReason::Normal)?;
        self.state = BootState::Clean;

        Ok(BootOutcome {
            state: outcome_state,
            previous,
            records,
            ledger,
            temporaries,
            notice,
        })
    }

    pub fn pending_notices(&self) -> &[RecoveryNotice] {
        &self.pending
    }

    /// Enqueue pending recovery notices on `alarm.o`, oldest first.
    ///
    /// Stops at the first relay failure and keeps the rest for the next
    /// call. Returns how many were sent.
    pub async fn flush_notices(
        &mut self,
        queue: &MessageQueue,
        client: &DeviceId,
        site: &str,
        now: Epoch,
    ) -> Result<usize, StoreError> {
        let mut sent = 0;
        for notice in &self.pending {
            let report = AlarmReport {
                client: client.clone(),
                site: site.to_string(),
                tank: 0,
                level: 0.0,
                epoch: now,
                alarm: AlarmKind::Recovery(notice.clone()),
            };
            if let Err(e) = queue.enqueue(ALARM_OUT, &report).await {
                log::warn!("Could not send recovery notice, will retry: {}", e);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            self.pending = self.pending.split_off(sent);
            self.save_pending()?;
            log::info!("Sent {} recovery notice(s)", sent);
        }
        Ok(sent)
    }

    /// Drop pending notices without sending them, for nodes with no
    /// upstream to report to.
    pub fn clear_notices(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending.clear();
        self.save_pending()
    }

    /// Record that the process is running, so an unannounced stop is
    /// classified as a crash at the next boot.
    pub fn mark_running(&mut self) -> Result<(), StoreError> {
        self.write_state(RecoveryReason::Unknown)
    }

    /// Tag a risky operation. Until [`end_operation`](Self::end_operation),
    /// a crash is reported as interrupting `tag`.
    pub fn begin_operation(&mut self, tag: &str) -> Result<(), StoreError> {
        self.write_state(RecoveryReason::Operation(tag.to_string()))
    }

    pub fn end_operation(&mut self) -> Result<(), StoreError> {
        self.write_state(RecoveryReason::Unknown)
    }

    pub fn beat(&mut self, now: Epoch, uptime: Duration) -> Result<(), StoreError> {
        self.heartbeat.beat(now, uptime).map(|_| ())
    }

    /// Clean shutdown: the caller has already flushed its backups.
    pub fn shutdown(&mut self) -> Result<(), StoreError> {
        self.write_state(RecoveryReason::Normal)?;
        log::info!("Recorded clean shutdown");
        Ok(())
    }

    pub fn read_state(&self) -> Result<Option<RecoveryState>, StoreError> {
        match self.store.load_json::<RecoveryState>(files::RECOVERY_STATE) {
            Ok(state) => Ok(state),
            Err(StoreError::DeserializationError(e)) => {
                log::warn!("Unreadable recovery state, assuming power loss: {}", e);
                Ok(Some(RecoveryState {
                    reason: RecoveryReason::Unknown,
                    heartbeat: Epoch::UNKNOWN,
                }))
            }
            Err(e) => Err(e),
        }
    }

    fn write_state(&self, reason: RecoveryReason) -> Result<(), StoreError> {
        let state = RecoveryState {
            reason,
            heartbeat: self.heartbeat.last_epoch(),
        };
        self.store.write_json(files::RECOVERY_STATE, &state)
    }

    fn load_pending(&self) -> Vec<RecoveryNotice> {
        match self.store.load_json::<Vec<RecoveryNotice>>(files::PENDING_NOTICES) {
            Ok(pending) => pending.unwrap_or_default(),
            Err(e) => {
                log::warn!("Pending recovery notices unreadable, dropping them: {}", e);
                Vec::new()
            }
        }
    }

    fn save_pending(&self) -> Result<(), StoreError> {
        self.store.write_json(files::PENDING_NOTICES, &self.pending)
    }

    fn restore_records<R: DeserializeOwned>(&self, recovering: bool) -> (Vec<R>, usize) {
        match self.store.read_lines::<R>(files::RECORDS_BACKUP) {
            Ok(lines) => (lines.entries, lines.skipped),
            Err(StoreError::NotFound(_)) => {
                if recovering {
                    log::warn!("No records backup to restore, starting empty");
                }
                (Vec::new(), 0)
            }
            Err(e) => {
                log::warn!("Records backup unreadable, starting empty: {}", e);
                (Vec::new(), 0)
            }
        }
    }

    fn restore_ledger(&self, recovering: bool) -> (ReportLedger, usize) {
        match ReportLedger::load(&self.store) {
            Ok((ledger, skipped)) => {
                if recovering && ledger.is_empty() {
                    log::warn!("No report dates to restore");
                }
                (ledger, skipped)
            }
            Err(e) => {
                log::warn!("Report dates unreadable, starting empty: {}", e);
                (ReportLedger::new(), 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceId;
    use crate::queue::ALARM_IN;
    use crate::relay::simulated::{EndpointRole, SimRelayNetwork};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        tank: u8,
        level: f64,
    }

    const NOW: Epoch = Epoch(1_763_701_200);

    fn seed_backups(store: &AtomicStore) {
        store
            .write_lines(
                files::RECORDS_BACKUP,
                &[Rec { tank: 1, level: 10.0 }, Rec { tank: 2, level: 20.0 }],
            )
            .unwrap();
        let mut ledger = ReportLedger::new();
        ledger.mark_sent("daily", NOW);
        ledger.save(store).unwrap();
    }

    #[test]
    fn test_first_boot_is_clean() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        let mut manager = RecoveryManager::new(store, 300);

        let outcome = manager.boot::<Rec>(NOW).unwrap();
        assert_eq!(outcome.state, BootState::Clean);
        assert!(outcome.notice.is_none());
        assert!(outcome.records.is_empty());
        assert_eq!(
            manager.read_state().unwrap().unwrap().reason,
            RecoveryReason::Normal
        );
    }

    #[test]
    fn test_normal_shutdown_boots_clean_and_loads_quietly() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        seed_backups(&store);

        let mut first = RecoveryManager::new(store.clone(), 300);
        first.boot::<Rec>(NOW).unwrap();
        first.mark_running().unwrap();
        first.shutdown().unwrap();

        let mut second = RecoveryManager::new(store, 300);
        let outcome = second.boot::<Rec>(NOW).unwrap();
        assert_eq!(outcome.state, BootState::Clean);
        assert!(outcome.notice.is_none());
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.ledger.already_sent("daily", NOW));
    }

    #[test]
    fn test_operation_tag_means_recovering() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        seed_backups(&store);

        let mut first = RecoveryManager::new(store.clone(), 300);
        first.boot::<Rec>(NOW).unwrap();
        first.mark_running().unwrap();
        first.beat(NOW, Duration::from_secs(60)).unwrap();
        first.begin_operation("command_apply").unwrap();
        // Power lost here.

        let mut second = RecoveryManager::new(store, 300);
        let outcome = second.boot::<Rec>(NOW.plus_secs(900)).unwrap();
        assert_eq!(outcome.state, BootState::Recovering);
        assert_eq!(second.state(), BootState::Clean);
        assert_eq!(outcome.records, vec![Rec { tank: 1, level: 10.0 }, Rec { tank: 2, level: 20.0 }]);

        let notice = outcome.notice.unwrap();
        assert_eq!(
            notice.cause,
            SuspectedCause::InterruptedOperation {
                operation: "command_apply".to_string()
            }
        );
        assert_eq!(notice.records_restored, 2);
        assert_eq!(notice.report_dates_restored, 1);
        assert_eq!(notice.downtime_secs, Some(900));
        assert_eq!(
            second.read_state().unwrap().unwrap().reason,
            RecoveryReason::Normal
        );
    }

    #[test]
    fn test_running_state_means_power_loss() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();

        let mut first = RecoveryManager::new(store.clone(), 300);
        first.boot::<Rec>(Epoch::UNKNOWN).unwrap();
        first.mark_running().unwrap();

        let mut second = RecoveryManager::new(store, 300);
        let outcome = second.boot::<Rec>(Epoch::UNKNOWN).unwrap();
        let notice = outcome.notice.unwrap();
        assert_eq!(notice.cause, SuspectedCause::PowerLoss);
        // No backups: not fatal, nothing restored, no downtime without a clock.
        assert_eq!(notice.records_restored, 0);
        assert_eq!(notice.downtime_secs, None);
    }

    #[test]
    fn test_corrupt_backup_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        store
            .write_atomic(
                files::RECORDS_BACKUP,
                b"{\"tank\":1,\"level\":1.0}\n{\"tank\":\n{\"tank\":3,\"level\":3.0}\n",
            )
            .unwrap();
        store.write_atomic(files::RECOVERY_STATE, b"{\"reason\":\"unknown\",\"heartbeat\":0}").unwrap();

        let mut manager = RecoveryManager::new(store, 300);
        let outcome = manager.boot::<Rec>(NOW).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.notice.unwrap().skipped_entries, 1);
    }

    #[test]
    fn test_unreadable_state_is_treated_as_crash() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        store.write_atomic(files::RECOVERY_STATE, b"garbage").unwrap();

        let mut manager = RecoveryManager::new(store, 300);
        let outcome = manager.boot::<Rec>(NOW).unwrap();
        assert_eq!(outcome.state, BootState::Recovering);
    }

    #[tokio::test]
    async fn test_notice_waits_for_the_relay() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        store.write_atomic(files::RECOVERY_STATE, b"{\"reason\":\"unknown\",\"heartbeat\":0}").unwrap();

        let network = SimRelayNetwork::new();
        network.set_time(NOW);
        let client = DeviceId::new("dev:1");
        let server = DeviceId::new("dev:server");
        let queue = MessageQueue::new(Arc::new(network.attach(client.clone(), EndpointRole::Device)));
        let server_queue =
            MessageQueue::new(Arc::new(network.attach(server, EndpointRole::Coordinator)));

        let mut manager = RecoveryManager::new(store.clone(), 300);
        let outcome = manager.boot::<Rec>(NOW).unwrap();
        let notice = outcome.notice.unwrap();
        assert_eq!(manager.pending_notices(), &[notice.clone()]);

        network.set_online(false);
        assert_eq!(manager.flush_notices(&queue, &client, "North", NOW).await.unwrap(), 0);
        assert_eq!(manager.pending_notices().len(), 1);

        network.set_online(true);
        assert_eq!(manager.flush_notices(&queue, &client, "North", NOW).await.unwrap(), 1);
        assert!(manager.pending_notices().is_empty());
        assert_eq!(manager.flush_notices(&queue, &client, "North", NOW).await.unwrap(), 0);
        network.sync();

        let drained = server_queue.drain::<AlarmReport>(ALARM_IN).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.messages[0].body.alarm, AlarmKind::Recovery(notice));
    }

    #[test]
    fn test_unsent_notice_survives_a_clean_restart() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        store.write_atomic(files::RECOVERY_STATE, b"{\"reason\":\"unknown\",\"heartbeat\":0}").unwrap();

        let mut first = RecoveryManager::new(store.clone(), 300);
        let notice = first.boot::<Rec>(NOW).unwrap().notice.unwrap();
        first.mark_running().unwrap();
        first.shutdown().unwrap();

        let mut second = RecoveryManager::new(store.clone(), 300);
        let outcome = second.boot::<Rec>(NOW).unwrap();
        assert_eq!(outcome.state, BootState::Clean);
        assert!(outcome.notice.is_none());
        assert_eq!(second.pending_notices(), &[notice]);

        second.clear_notices().unwrap();
        let mut third = RecoveryManager::new(store, 300);
        third.boot::<Rec>(NOW).unwrap();
        assert!(third.pending_notices().is_empty());
    }
}
