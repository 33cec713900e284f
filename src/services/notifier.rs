use crate::types::NotificationEvent;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Fire-and-forget sink for portfolio notifications.
///
/// Emitting never fails the caller.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: NotificationEvent);
}

/// Broadcasts notifications to in-process subscribers and logs them.
pub struct Notifier {
    tx: broadcast::Sender<NotificationEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for Notifier {
    fn emit(&self, event: NotificationEvent) {
        info!(
            kind = event.kind.as_str(),
            user_id = %event.user_id,
            game_id = event.game_id,
            portfolio_id = event.portfolio_id,
            "{}",
            event.title
        );
        if self.tx.send(event).is_err() {
            debug!("No notification subscribers");
        }
    }
}
