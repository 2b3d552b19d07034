//! Deferred and recurring actions keyed by operation.
//!
//! Every scheduled action only posts a [`Inbound::Timer`] back into the
//! updater loop. The loop asks [`Scheduler::fire`] whether that message is
//! still current before acting on it, so a cancelled or replaced timer whose
//! message was already queued does nothing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::model::MacAddress;
use crate::service::Inbound;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flow {
    Ota,
    ControlData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    FirmwarePacket,
    UploadComplete,
    Removal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub flow: Flow,
    pub address: MacAddress,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(flow: Flow, address: MacAddress, kind: TimerKind) -> Self {
        TimerKey {
            flow,
            address,
            kind,
        }
    }
}

struct Entry {
    generation: u64,
    recurring: bool,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    inbound: UnboundedSender<Inbound>,
    entries: HashMap<TimerKey, Entry>,
    next_generation: u64,
}

impl Scheduler {
    pub fn new(inbound: UnboundedSender<Inbound>) -> Self {
        Scheduler {
            inbound,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// One shot after `delay`. Replaces any timer under the same key.
    pub fn after(&mut self, key: TimerKey, delay: Duration) {
        let generation = self.bump();
        let inbound = self.inbound.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = inbound.send(Inbound::Timer { key, generation });
        });
        self.insert(key, generation, false, handle);
    }

    /// Fires every `period`, first tick immediately. Replaces any timer
    /// under the same key.
    pub fn every(&mut self, key: TimerKey, period: Duration) {
        let generation = self.bump();
        let inbound = self.inbound.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if inbound.send(Inbound::Timer { key, generation }).is_err() {
                    break;
                }
            }
        });
        self.insert(key, generation, true, handle);
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// True when a timer message is still current. A one-shot is consumed.
    pub fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => {
                if !entry.recurring {
                    self.entries.remove(key);
                }
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some(entry) = self.entries.remove(key) {
            entry.handle.abort();
        }
    }

    /// Everything scheduled for one operation.
    pub fn cancel_operation(&mut self, flow: Flow, address: MacAddress) {
        self.entries.retain(|key, entry| {
            let owned = key.flow == flow && key.address == address;
            if owned {
                entry.handle.abort();
            }
            !owned
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn insert(&mut self, key: TimerKey, generation: u64, recurring: bool, handle: JoinHandle<()>) {
        let entry = Entry {
            generation,
            recurring,
            handle,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            previous.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn key(kind: TimerKind) -> TimerKey {
        TimerKey::new(Flow::Ota, MacAddress::new([1, 2, 3, 4, 5, 6]), kind)
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        scheduler.after(key(TimerKind::Removal), Duration::from_secs(3));

        let Some(Inbound::Timer { key: fired, generation }) = rx.recv().await else {
            panic!("expected a timer");
        };
        assert_eq!(fired, key(TimerKind::Removal));
        assert!(scheduler.fire(&fired, generation));
        assert!(!scheduler.fire(&fired, generation));
        assert!(!scheduler.is_scheduled(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_timer_message_is_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        let removal = key(TimerKind::Removal);
        scheduler.after(removal, Duration::from_millis(10));
        let Some(Inbound::Timer { generation: first, .. }) = rx.recv().await else {
            panic!("expected a timer");
        };

        scheduler.after(removal, Duration::from_millis(10));
        assert!(!scheduler.fire(&removal, first));
        let Some(Inbound::Timer { generation: second, .. }) = rx.recv().await else {
            panic!("expected a timer");
        };
        assert!(scheduler.fire(&removal, second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_interval_stops_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        let packets = key(TimerKind::FirmwarePacket);
        scheduler.every(packets, Duration::from_millis(8));

        for _ in 0..3 {
            let Some(Inbound::Timer { generation, .. }) = rx.recv().await else {
                panic!("expected a tick");
            };
            assert!(scheduler.fire(&packets, generation));
        }
        scheduler.cancel_operation(Flow::Ota, packets.address);
        assert!(!scheduler.is_scheduled(&packets));
    }
}
