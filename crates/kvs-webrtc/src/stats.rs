use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::debug;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use webrtc::peer_connection::RTCPeerConnection;

use crate::types::SessionEvent;

type Targets = Arc<Mutex<HashMap<String, Arc<RTCPeerConnection>>>>;

fn lock(targets: &Targets) -> MutexGuard<'_, HashMap<String, Arc<RTCPeerConnection>>> {
    targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One periodic statistics task per session, covering every watched connection
pub(crate) struct StatsPoller {
    interval: Duration,
    targets: Targets,
    task: Option<JoinHandle<()>>,
}

impl StatsPoller {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Default::default(),
            task: None,
        }
    }

    pub(crate) fn watch(&self, client_id: &str, connection: Arc<RTCPeerConnection>) {
        lock(&self.targets).insert(client_id.to_string(), connection);
    }

    pub(crate) fn unwatch(&self, client_id: &str) {
        lock(&self.targets).remove(client_id);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start polling, does nothing if already running
    pub(crate) fn start(&mut self, events_tx: flume::Sender<SessionEvent>) {
        if self.task.is_some() {
            return;
        }
        debug!("starting statistics polling every {:?}", self.interval);
        let targets = self.targets.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let snapshot: Vec<_> = lock(&targets)
                    .iter()
                    .map(|(id, connection)| (id.clone(), connection.clone()))
                    .collect();
                for (client_id, connection) in snapshot {
                    let report = connection.get_stats().await;
                    if events_tx.send(SessionEvent::Stats { client_id, report }).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("stopping statistics polling");
            task.abort();
        }
        lock(&self.targets).clear();
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
