use crate::prelude::*;

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new<T: Into<String>, M: Into<String>>(title: T, message: M) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_mqtt: broadcast::Sender<crate::mqtt::Message>,
    pub to_mqtt: broadcast::Sender<crate::mqtt::Message>,
    pub notifications: broadcast::Sender<Notification>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_mqtt: Self::channel(),
            to_mqtt: Self::channel(),
            notifications: Self::channel(),
        }
    }

    /// Nobody listening is fine, notifications are best effort.
    pub fn notify(&self, notification: Notification) {
        info!("notification: {}: {}", notification.title, notification.message);
        let _ = self.notifications.send(notification);
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
