//! Lifecycle notifications and cooperative cancellation shared by the update pipelines.

use crate::error::{Result, UpdateError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Pipeline step a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The whole update run, wrapping every other stage.
    Process,
    Check,
    Download,
    Unzip,
    Install,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Started { stage: Stage, message: String },
    Finished { stage: Stage, message: String },
    Error { message: String },
}

impl Notification {
    pub fn message(&self) -> &str {
        match self {
            Notification::Started { message, .. }
            | Notification::Finished { message, .. }
            | Notification::Error { message } => message,
        }
    }
}

/// Sending half of the notification channel.
///
/// Emitting never fails: once every receiver is gone notifications are dropped.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    sender: Option<Sender<Notification>>,
}

impl Notifier {
    /// Creates a notifier together with the receiver callers subscribe on.
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A notifier nobody listens to.
    pub fn silent() -> Self {
        Self { sender: None }
    }

    pub fn started<S: Into<String>>(&self, stage: Stage, message: S) {
        self.emit(Notification::Started {
            stage,
            message: message.into(),
        });
    }

    pub fn finished<S: Into<String>>(&self, stage: Stage, message: S) {
        self.emit(Notification::Finished {
            stage,
            message: message.into(),
        });
    }

    pub fn error<S: Into<String>>(&self, message: S) {
        self.emit(Notification::Error {
            message: message.into(),
        });
    }

    fn emit(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(notification);
        }
    }
}

/// Cancellation flag checked at stage boundaries and between download chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns [`UpdateError::Cancelled`] once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
