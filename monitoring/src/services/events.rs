use tokio::sync::broadcast;

use super::alerts::Alert;
use super::health::HealthStatus;
use super::system::SystemSnapshot;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum MonitoringEvent {
    AlertRaised(Alert),
    HealthStatusChanged {
        previous: Option<HealthStatus>,
        current: HealthStatus,
    },
    SampleRecorded(SystemSnapshot),
}

/// Fan-out of engine events to any number of listeners.
///
/// Publishing never blocks; slow subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitoringEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, event: MonitoringEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
