//! Per-agent work queue.
//!
//! Entries come out in posting order, with two exceptions: `Restore` and entries
//! posted with `front` jump the queue. A `Message` posted while another message
//! still waits at the tail folds into it, so a burst of chat lines becomes one
//! turn. Steering requests bypass the queue entirely: the running script picks
//! them up at its next checkpoint.

use daycare_core::{DaycareError, FileRef, Millis, now_millis};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

/// Work an agent can be asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxItem {
    /// Clear the conversation context.
    Reset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Finish whatever the previous process left half done.
    Restore,
    /// A user message from a connector.
    Message {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<FileRef>,
        #[serde(default)]
        context: MessageContext,
    },
    /// A message from the system itself (schedulers, other agents).
    SystemMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
}

/// Where a message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InboxItem {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            files: vec![],
            context: MessageContext::default(),
        }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::Restore => "restore",
            Self::Message { .. } => "message",
            Self::SystemMessage { .. } => "system_message",
        }
    }
}

/// An out-of-band instruction for the script that is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Steering {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// What handling an entry produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxResult {
    /// Final assistant text of the turn, if it ended with one.
    pub response_text: Option<String>,
    /// The turn ended through `skip()`.
    pub skipped: bool,
}

/// Outcome delivered to everyone waiting on an entry. Merged posters share it.
pub type InboxOutcome = std::result::Result<InboxResult, Arc<DaycareError>>;

pub type Completion = oneshot::Sender<InboxOutcome>;

/// A queued entry, with the completions of every post merged into it.
#[derive(Debug)]
pub struct InboxEntry {
    pub id: String,
    pub posted_at: Millis,
    pub item: InboxItem,
    /// Later messages may still fold into this entry.
    pub mergeable: bool,
    pub completions: Vec<Completion>,
}

impl InboxEntry {
    /// Deliver `outcome` to every poster.
    pub fn complete(self, outcome: InboxOutcome) {
        for completion in self.completions {
            let _ = completion.send(outcome.clone());
        }
    }

    fn queued(&self) -> QueuedEntry {
        QueuedEntry {
            id: self.id.clone(),
            posted_at: self.posted_at,
            item: self.item.clone(),
            mergeable: self.mergeable,
        }
    }
}

/// A view of a queued entry, without its completions.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEntry {
    pub id: String,
    pub posted_at: Millis,
    pub item: InboxItem,
    pub mergeable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    /// Reuse this id (replay). A fresh time-ordered id otherwise.
    pub id: Option<String>,
    pub posted_at: Option<Millis>,
    /// `Some(false)` keeps the entry apart from its neighbours.
    pub merge: Option<bool>,
    /// Deliver before everything already queued.
    pub front: bool,
}

impl PostOptions {
    pub fn front() -> Self {
        Self {
            front: true,
            ..Default::default()
        }
    }

    /// Options for re-posting a stored entry exactly as it was.
    pub fn replay(id: impl Into<String>, posted_at: Millis) -> Self {
        Self {
            id: Some(id.into()),
            posted_at: Some(posted_at),
            merge: Some(false),
            front: false,
        }
    }
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<InboxEntry>,
    consumers: usize,
    steering: Option<Steering>,
}

/// The queue itself. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct AgentInbox {
    state: Mutex<InboxState>,
    notify: Notify,
}

impl AgentInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item`. Returns the entry as it now sits in the queue, which is the
    /// tail entry it was merged into when a merge happened.
    pub fn post(&self, item: InboxItem, completion: Option<Completion>, options: PostOptions) -> QueuedEntry {
        let mut state = self.state.lock();
        let may_merge = options.merge != Some(false) && !options.front;

        if may_merge
            && let InboxItem::Message { .. } = &item
            && let Some(tail) = state.queue.back_mut()
            && tail.mergeable
            && let InboxItem::Message { .. } = &tail.item
        {
            merge_message(&mut tail.item, item);
            tail.completions.extend(completion);
            let queued = tail.queued();
            drop(state);
            self.notify.notify_waiters();
            return queued;
        }

        let entry = InboxEntry {
            id: options.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            posted_at: options.posted_at.unwrap_or_else(now_millis),
            mergeable: options.merge.unwrap_or(true),
            completions: completion.into_iter().collect(),
            item,
        };
        let queued = entry.queued();
        if options.front || matches!(entry.item, InboxItem::Restore) {
            state.queue.push_front(entry);
        } else {
            state.queue.push_back(entry);
        }
        drop(state);
        self.notify.notify_waiters();
        queued
    }

    /// Wait for the next entry. `None` once no consumer is attached.
    pub async fn next(&self) -> Option<InboxEntry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.consumers == 0 {
                    return None;
                }
                if let Some(entry) = state.queue.pop_front() {
                    return Some(entry);
                }
            }
            notified.await;
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn list_pending(&self) -> Vec<QueuedEntry> {
        self.state.lock().queue.iter().map(InboxEntry::queued).collect()
    }

    /// Remove and return every queued entry.
    pub fn drain_pending(&self) -> Vec<InboxEntry> {
        self.state.lock().queue.drain(..).collect()
    }

    pub fn attach(&self) {
        self.state.lock().consumers += 1;
        self.notify.notify_waiters();
    }

    pub fn detach(&self) {
        {
            let mut state = self.state.lock();
            state.consumers = state.consumers.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().consumers > 0
    }

    /// Replace the pending steering request.
    pub fn steer(&self, steering: Steering) {
        self.state.lock().steering = Some(steering);
    }

    pub fn has_steering(&self) -> bool {
        self.state.lock().steering.is_some()
    }

    /// Take the pending steering request, leaving none behind.
    pub fn consume_steering(&self) -> Option<Steering> {
        self.state.lock().steering.take()
    }
}

fn merge_message(tail: &mut InboxItem, newer: InboxItem) {
    let (
        InboxItem::Message {
            text,
            files,
            context,
        },
        InboxItem::Message {
            text: new_text,
            files: new_files,
            context: new_context,
        },
    ) = (tail, newer)
    else {
        return;
    };
    text.push('\n');
    text.push_str(&new_text);
    files.extend(new_files);
    if new_context.message_id.is_some() {
        context.message_id = new_context.message_id;
    }
    if new_context.source.is_some() {
        context.source = new_context.source;
    }
}
