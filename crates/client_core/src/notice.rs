use std::{sync::Arc, time::Duration};

use shared::error::ErrorCode;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::{error::BackendError, SessionEvent};

/// A dismissible, user-facing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Default)]
struct NoticeState {
    next_id: u64,
    active: Vec<Notice>,
}

pub(crate) struct NoticeBoard {
    ttl: Duration,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<NoticeState>,
}

impl NoticeBoard {
    pub(crate) fn new(ttl: Duration, events: broadcast::Sender<SessionEvent>) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            events,
            state: Mutex::new(NoticeState::default()),
        })
    }

    /// Shows `err` and schedules it to disappear after the notice ttl.
    pub(crate) async fn raise(self: &Arc<Self>, err: &BackendError) -> Notice {
        let notice = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let notice = Notice {
                id: state.next_id,
                code: err.code(),
                message: err.user_message().to_string(),
            };
            state.active.push(notice.clone());
            notice
        };
        debug!(id = notice.id, code = ?notice.code, %err, "notice raised");
        let _ = self.events.send(SessionEvent::Notice(notice.clone()));

        let board = Arc::clone(self);
        let id = notice.id;
        tokio::spawn(async move {
            tokio::time::sleep(board.ttl).await;
            board.dismiss(id).await;
        });
        notice
    }

    pub(crate) async fn dismiss(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        let before = state.active.len();
        state.active.retain(|notice| notice.id != id);
        state.active.len() != before
    }

    pub(crate) async fn active(&self) -> Vec<Notice> {
        self.state.lock().await.active.clone()
    }
}
