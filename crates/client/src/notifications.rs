// SPDX-License-Identifier: Apache-2.0

//! Operator notifications, emitted idempotently per class.

use tracing::info;

/// The class of an operator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Entries were added to, rewritten in, or removed from the error queue.
    ErrorQueueChanged,
    /// The error queue drained completely.
    ErrorQueueEmptied,
    /// The local attribute mappings no longer line up with the server
    /// schema.
    DatamodelWarnings,
    /// Previously reported datamodel warnings are all resolved.
    DatamodelWarningsCleared,
}

/// One operator notification. Delivery (mail, chat, ...) is the sink's
/// business.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The class of the notification.
    pub kind: NotificationKind,
    /// Short subject line.
    pub subject: String,
    /// Free-form body with the relevant context.
    pub body: String,
}

/// Consumer of operator notifications.
pub trait NotificationSink: Send {
    /// Delivers one notification.
    fn notify(&mut self, notification: Notification);
}

/// Tracks per-class state so each transition is reported exactly once:
/// clearing an already-cleared class emits nothing.
pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    queue_nonempty: bool,
    warnings_body: Option<String>,
}

impl Notifier {
    /// A notifier over the given sink.
    #[must_use]
    pub fn new(sink: Box<dyn NotificationSink>) -> Self {
        Self {
            sink,
            queue_nonempty: false,
            warnings_body: None,
        }
    }

    /// Reports a change of the error queue contents. `now_empty` drives the
    /// emptied/changed distinction; repeated empty reports emit nothing.
    pub fn error_queue_changed(&mut self, now_empty: bool, body: String) {
        if now_empty {
            if self.queue_nonempty {
                self.queue_nonempty = false;
                self.emit(
                    NotificationKind::ErrorQueueEmptied,
                    "no more objects in error queue",
                    body,
                );
            }
        } else {
            self.queue_nonempty = true;
            self.emit(
                NotificationKind::ErrorQueueChanged,
                "objects in error queue have changed",
                body,
            );
        }
    }

    /// Reports datamodel warnings; an unchanged warning body is not
    /// re-reported.
    pub fn datamodel_warnings(&mut self, body: String) {
        if self.warnings_body.as_ref() == Some(&body) {
            return;
        }
        self.warnings_body = Some(body.clone());
        self.emit(NotificationKind::DatamodelWarnings, "datamodel warnings", body);
    }

    /// Reports that all datamodel warnings are resolved; at most once per
    /// active warning.
    pub fn datamodel_warnings_cleared(&mut self) {
        if self.warnings_body.take().is_some() {
            self.emit(
                NotificationKind::DatamodelWarningsCleared,
                "no more datamodel warnings",
                String::new(),
            );
        }
    }

    fn emit(&mut self, kind: NotificationKind, subject: &str, body: String) {
        info!(subject, "operator notification");
        self.sink.notify(Notification {
            kind,
            subject: subject.to_string(),
            body,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Collect(Arc<Mutex<Vec<Notification>>>);

    impl NotificationSink for Collect {
        fn notify(&mut self, notification: Notification) {
            self.0.lock().expect("lock").push(notification);
        }
    }

    #[test]
    fn emptied_is_reported_once() {
        let sink = Collect::default();
        let mut notifier = Notifier::new(Box::new(sink.clone()));

        notifier.error_queue_changed(false, "2 entries".to_string());
        notifier.error_queue_changed(true, String::new());
        notifier.error_queue_changed(true, String::new());

        let kinds: Vec<NotificationKind> =
            sink.0.lock().expect("lock").iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::ErrorQueueChanged,
                NotificationKind::ErrorQueueEmptied
            ]
        );
    }

    #[test]
    fn warnings_clear_idempotently() {
        let sink = Collect::default();
        let mut notifier = Notifier::new(Box::new(sink.clone()));

        notifier.datamodel_warnings("Users: login is gone".to_string());
        // Same body again: nothing new to say.
        notifier.datamodel_warnings("Users: login is gone".to_string());
        notifier.datamodel_warnings_cleared();
        notifier.datamodel_warnings_cleared();

        let kinds: Vec<NotificationKind> =
            sink.0.lock().expect("lock").iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::DatamodelWarnings,
                NotificationKind::DatamodelWarningsCleared
            ]
        );
    }
}
