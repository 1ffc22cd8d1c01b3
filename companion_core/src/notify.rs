use flume::Sender;

use crate::collaborators::Notifier;
use crate::context::truncate_with_ellipsis;
use crate::events::EngineEvent;

const NOTIFICATION_BODY_CHARS: usize = 100;

pub fn notification_title(display_name: &str) -> String {
    format!("{} said", display_name)
}

pub fn notification_body(text: &str) -> String {
    truncate_with_ellipsis(text, NOTIFICATION_BODY_CHARS)
}

/// Forwards notifications to the front-end as [`EngineEvent::Notification`].
pub struct EventNotifier {
    event_tx: Sender<EngineEvent>,
}

impl EventNotifier {
    pub fn new(event_tx: Sender<EngineEvent>) -> Self {
        Self { event_tx }
    }
}

impl Notifier for EventNotifier {
    fn notify(&self, title: &str, text: &str) {
        tracing::info!("Notification: {}", title);
        if self
            .event_tx
            .send(EngineEvent::Notification {
                title: title.to_string(),
                text: text.to_string(),
            })
            .is_err()
        {
            tracing::warn!("Notification dropped: no front-end listening");
        }
    }
}
