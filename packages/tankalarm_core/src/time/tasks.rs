//! TaskTable: next-due epoch per recurring task
//!
//! The control loop asks the table which tasks are due once per iteration
//! instead of blocking inside any single task. While the clock is unknown,
//! tasks that declare an hour-tick fallback still run on uptime hours.

use std::time::Duration;

use super::{Epoch, ScheduleSpec};

/// How a task recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed wall-clock grid anchored to an hour of day. First run is the
    /// next slot, not immediately.
    Aligned(ScheduleSpec),
    /// Every `secs` seconds. First run is immediate.
    Every { secs: i64 },
}

impl Cadence {
    fn next_after(&self, now: Epoch) -> Option<Epoch> {
        match self {
            Cadence::Aligned(spec) => spec.next_after(now),
            Cadence::Every { secs } if *secs > 0 => Some(now.plus_secs(*secs)),
            Cadence::Every { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    task: T,
    cadence: Cadence,
    next_due: Option<Epoch>,
    fallback_hours: Option<u64>,
    last_tick: Option<u64>,
}

/// Scheduling table keyed by task.
#[derive(Debug, Clone)]
pub struct TaskTable<T> {
    entries: Vec<Entry<T>>,
}

impl<T: Copy + PartialEq + std::fmt::Debug> TaskTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add or replace a task. Replacing resets its next-due time.
    pub fn insert(&mut self, task: T, cadence: Cadence, fallback_hours: Option<u64>) -> &mut Self {
        let entry = Entry {
            task,
            cadence,
            next_due: None,
            fallback_hours,
            last_tick: None,
        };
        match self.entries.iter_mut().find(|e| e.task == task) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub fn remove(&mut self, task: T) {
        self.entries.retain(|e| e.task != task);
    }

    pub fn contains(&self, task: T) -> bool {
        self.entries.iter().any(|e| e.task == task)
    }

    /// Tasks due at `now`, each advanced to its next slot strictly after `now`.
    ///
    /// Returns nothing while `now` is unknown.
    pub fn due(&mut self, now: Epoch) -> Vec<T> {
        self.due_slots(now).into_iter().map(|(task, _)| task).collect()
    }

    /// Like [`due`](Self::due), paired with the slot each task fired for:
    /// the scheduled instant, or `now` for a first immediate run.
    pub fn due_slots(&mut self, now: Epoch) -> Vec<(T, Epoch)> {
        if !now.is_known() {
            return Vec::new();
        }
        let mut due = Vec::new();
        for entry in &mut self.entries {
            let slot = match (entry.next_due, entry.cadence) {
                (Some(next), _) if now >= next => Some(next),
                (Some(_), _) => None,
                (None, Cadence::Every { .. }) => Some(now),
                (None, Cadence::Aligned(_)) => None,
            };
            if slot.is_some() || entry.next_due.is_none() {
                entry.next_due = entry.cadence.next_after(now);
                if entry.next_due.is_none() {
                    log::warn!("Task {:?} has an invalid cadence {:?}", entry.task, entry.cadence);
                }
            }
            if let Some(slot) = slot {
                due.push((entry.task, slot));
            }
        }
        due
    }

    /// Tasks due by the hour-tick fallback, for use while the epoch is unknown.
    pub fn due_by_ticks(&mut self, hours: u64) -> Vec<T> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            let Some(every) = entry.fallback_hours.filter(|h| *h > 0) else {
                continue;
            };
            let fire = match entry.last_tick {
                None => true,
                Some(last) => hours >= last + every,
            };
            if fire {
                entry.last_tick = Some(hours);
                due.push(entry.task);
            }
        }
        due
    }

    pub fn next_due(&self, task: T) -> Option<Epoch> {
        self.entries
            .iter()
            .find(|e| e.task == task)
            .and_then(|e| e.next_due)
    }

    /// Earliest next-due epoch across all tasks.
    pub fn next_wake(&self) -> Option<Epoch> {
        self.entries.iter().filter_map(|e| e.next_due).min()
    }
}

impl<T: Copy + PartialEq + std::fmt::Debug> Default for TaskTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How long the loop may sleep before the next due task, capped at `max`.
pub fn wake_delay(now: Epoch, next_wake: Option<Epoch>, max: Duration) -> Duration {
    match next_wake {
        Some(next) if now.is_known() => {
            let secs = next.secs_since(now).max(0) as u64;
            Duration::from_secs(secs).min(max)
        }
        _ => max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SECONDS_PER_DAY, SECONDS_PER_HOUR};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Task {
        Sample,
        Report,
    }

    fn make_table() -> TaskTable<Task> {
        let mut table = TaskTable::new();
        table
            .insert(Task::Sample, Cadence::Every { secs: 1_800 }, Some(1))
            .insert(Task::Report, Cadence::Aligned(ScheduleSpec::daily(5, 0)), None);
        table
    }

    #[test]
    fn test_every_runs_immediately_then_on_interval() {
        let mut table = make_table();
        let day = 20_000 * SECONDS_PER_DAY;
        let now = Epoch(day + SECONDS_PER_HOUR);

        assert_eq!(table.due(now), vec![Task::Sample]);
        assert_eq!(table.next_due(Task::Sample), Some(now.plus_secs(1_800)));
        assert!(table.due(now.plus_secs(1_799)).is_empty());
        assert_eq!(table.due(now.plus_secs(1_800)), vec![Task::Sample]);
    }

    #[test]
    fn test_aligned_waits_for_slot() {
        let mut table = make_table();
        let day = 20_000 * SECONDS_PER_DAY;

        table.due(Epoch(day + SECONDS_PER_HOUR));
        assert_eq!(table.next_due(Task::Report), Some(Epoch(day + 5 * SECONDS_PER_HOUR)));
        assert_eq!(table.next_wake(), Some(Epoch(day + SECONDS_PER_HOUR + 1_800)));

        let due = table.due(Epoch(day + 5 * SECONDS_PER_HOUR + 10));
        assert!(due.contains(&Task::Report));
        assert_eq!(
            table.next_due(Task::Report),
            Some(Epoch(day + SECONDS_PER_DAY + 5 * SECONDS_PER_HOUR))
        );
    }

    #[test]
    fn test_due_slots_report_the_scheduled_instant() {
        let mut table = make_table();
        let day = 20_000 * SECONDS_PER_DAY;
        let start = Epoch(day + SECONDS_PER_HOUR);
        assert_eq!(table.due_slots(start), vec![(Task::Sample, start)]);

        let late = Epoch(day + 5 * SECONDS_PER_HOUR + 600);
        let due = table.due_slots(late);
        assert!(due.contains(&(Task::Report, Epoch(day + 5 * SECONDS_PER_HOUR))));
        assert!(due.contains(&(Task::Sample, start.plus_secs(1_800))));
    }

    #[test]
    fn test_long_sleep_fires_once() {
        let mut table = make_table();
        let day = 20_000 * SECONDS_PER_DAY;
        table.due(Epoch(day));
        let due = table.due(Epoch(day + 3 * SECONDS_PER_DAY));
        assert_eq!(due.iter().filter(|t| **t == Task::Report).count(), 1);
    }

    #[test]
    fn test_unknown_epoch_uses_tick_fallback() {
        let mut table = make_table();
        assert!(table.due(Epoch::UNKNOWN).is_empty());

        assert_eq!(table.due_by_ticks(0), vec![Task::Sample]);
        assert!(table.due_by_ticks(0).is_empty());
        assert_eq!(table.due_by_ticks(1), vec![Task::Sample]);
    }

    #[test]
    fn test_insert_replaces_existing_task() {
        let mut table = make_table();
        let now = Epoch(20_000 * SECONDS_PER_DAY);
        table.due(now);
        table.insert(Task::Sample, Cadence::Every { secs: 60 }, None);
        assert_eq!(table.next_due(Task::Sample), None);
        assert_eq!(table.due(now), vec![Task::Sample]);
        assert_eq!(table.next_due(Task::Sample), Some(now.plus_secs(60)));
    }

    #[test]
    fn test_wake_delay() {
        let now = Epoch(1_000);
        let max = Duration::from_secs(60);
        assert_eq!(wake_delay(now, Some(Epoch(1_030)), max), Duration::from_secs(30));
        assert_eq!(wake_delay(now, Some(Epoch(9_000)), max), max);
        assert_eq!(wake_delay(now, Some(Epoch(900)), max), Duration::ZERO);
        assert_eq!(wake_delay(Epoch::UNKNOWN, Some(Epoch(1_030)), max), max);
    }
}
