//! Live query subscriptions over the store.
//!
//! Mutations publish the [`Topic`]s they touched. A [`Subscription`] owns a
//! background task that delivers the current snapshot once, then re-runs its
//! query after every change to its topic, or once a snapshot that carries an
//! expiry goes out of date. Dropping or cancelling the subscription stops the
//! task.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use shared::{error::ApiError, protocol::Topic};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError, error::TryRecvError},
        mpsc,
    },
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::debug;

const SNAPSHOT_BUFFER: usize = 16;

#[derive(Clone)]
pub struct ChangeFeed {
    changes: broadcast::Sender<Topic>,
    live: Arc<AtomicUsize>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            changes,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, topic: Topic) {
        // No receivers just means nobody is watching.
        let _ = self.changes.send(topic);
    }

    pub fn live_subscriptions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Starts a subscription whose snapshots come from `load`.
    pub fn watch<T, F, Fut>(&self, topic: Topic, load: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        self.watch_expiring(topic, move || {
            let loaded = load();
            async move { loaded.await.map(|snapshot| (snapshot, None::<Duration>)) }
        })
    }

    /// Like [`ChangeFeed::watch`], for snapshots that go out of date on their
    /// own. `load` also returns how long its snapshot stays valid; the query
    /// re-runs once that elapses even if nothing was published.
    pub fn watch_expiring<T, F, Fut>(&self, topic: Topic, load: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(T, Option<Duration>), ApiError>> + Send + 'static,
    {
        // Subscribe before the first load so no change between the two is lost.
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);

        let task = tokio::spawn(async move {
            loop {
                let (snapshot, valid_for) = match load().await {
                    Ok((snapshot, valid_for)) => (Ok(snapshot), valid_for),
                    Err(err) => (Err(err), None),
                };
                let failed = snapshot.is_err();
                if tx.send(snapshot).await.is_err() || failed {
                    return;
                }
                let expires_at = valid_for.map(|valid_for| Instant::now() + valid_for);

                loop {
                    let changed = match expires_at {
                        Some(deadline) => tokio::select! {
                            changed = changes.recv() => Some(changed),
                            _ = time::sleep_until(deadline) => None,
                        },
                        None => Some(changes.recv().await),
                    };
                    let Some(changed) = changed else {
                        debug!(?topic, "feed: snapshot expired, reloading");
                        break;
                    };
                    match changed {
                        Ok(changed) if changed == topic => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(?topic, skipped, "feed: subscriber lagged, reloading");
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }

                // Coalesce a burst of changes into one reload.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription {
            topic,
            rx,
            task,
            _guard: LiveGuard::acquire(Arc::clone(&self.live)),
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Subscription<T> {
    topic: Topic,
    rx: mpsc::Receiver<Result<T, ApiError>>,
    task: JoinHandle<()>,
    _guard: LiveGuard,
}

impl<T> Subscription<T> {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next snapshot. `None` once the subscription has ended, which happens
    /// after a failed load.
    pub async fn next_snapshot(&mut self) -> Option<Result<T, ApiError>> {
        self.rx.recv().await
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
