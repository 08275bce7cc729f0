//! Incremental reveal of a completed response
//!
//! The full answer is already known when a reveal starts. The scheduler
//! writes it into the pending assistant message a few characters at a time
//! on a fixed cadence, so the client can render it as if it were typed.
//!
//! ```text
//! Idle -> Revealing -> Delivered
//!                   \-> Cancelled
//! ```
//!
//! Each reveal is one task owning its cursor. Ticks only ever touch the
//! message id they were started for, and stop as soon as that message is
//! gone or already finalized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::RevealSettings;
use crate::storage::StorageError;

use super::events::{EngineEvent, EventBus};
use super::messages::MessageStore;

/// Ticks spent retrying the final write before the reveal gives up
const FINAL_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealState {
    Idle,
    Revealing,
    Delivered,
    Cancelled,
}

/// The message a reveal writes into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealTarget {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealOutcome {
    pub state: RevealState,
    /// Chunks written before the reveal ended
    pub ticks: usize,
    /// Text stored in the message when the reveal ended
    pub text: String,
}

/// Shared stop flag for one generation
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running reveal
pub struct RevealHandle {
    cancel: CancelToken,
    state: watch::Receiver<RevealState>,
    task: JoinHandle<RevealOutcome>,
}

impl RevealHandle {
    /// Stop the cadence; the revealed prefix is kept and delivered
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RevealState {
        *self.state.borrow()
    }

    /// Wait for the reveal to reach a terminal state
    pub async fn join(self) -> RevealOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Reveal task failed");
                RevealOutcome {
                    state: RevealState::Cancelled,
                    ticks: 0,
                    text: String::new(),
                }
            }
        }
    }
}

pub struct RevealScheduler {
    store: Arc<MessageStore>,
    events: EventBus,
    settings: RevealSettings,
}

impl RevealScheduler {
    pub fn new(store: Arc<MessageStore>, events: EventBus, settings: RevealSettings) -> Self {
        Self {
            store,
            events,
            settings,
        }
    }

    /// Start revealing `text` into the target message.
    ///
    /// `pinned` is read after every chunk; while it is set a
    /// [`EngineEvent::ScrollToEnd`] follows each chunk.
    pub fn start(
        &self,
        target: RevealTarget,
        text: String,
        cancel: CancelToken,
        pinned: Arc<AtomicBool>,
    ) -> RevealHandle {
        let (state_tx, state_rx) = watch::channel(RevealState::Idle);

        let task = RevealTask {
            store: self.store.clone(),
            events: self.events.clone(),
            settings: self.settings,
            target,
            chars: text.chars().collect(),
            cancel: cancel.clone(),
            pinned,
            state: state_tx,
        };

        RevealHandle {
            cancel,
            state: state_rx,
            task: tokio::spawn(task.run()),
        }
    }
}

struct RevealTask {
    store: Arc<MessageStore>,
    events: EventBus,
    settings: RevealSettings,
    target: RevealTarget,
    chars: Vec<char>,
    cancel: CancelToken,
    pinned: Arc<AtomicBool>,
    state: watch::Sender<RevealState>,
}

impl RevealTask {
    async fn run(self) -> RevealOutcome {
        let chunk = self.settings.chunk_chars.max(1);
        let total = self.chars.len();
        self.state.send_replace(RevealState::Revealing);

        tracing::debug!(
            conversation_id = %self.target.conversation_id,
            message_id = %self.target.message_id,
            chars = total,
            "Reveal started"
        );

        if total == 0 {
            if let Err(e) = self.write(String::new(), true).await {
                tracing::error!(error = %e, "Failed to deliver empty reply");
            }
            return self.finish(RevealState::Delivered, 0, String::new());
        }

        let period = self.settings.interval();
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cursor = 0;
        let mut ticks = 0;
        let mut revealed = String::new();
        let mut final_failures = 0;

        loop {
            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = interval.tick() => false,
            };
            if cancelled {
                return self.stop(ticks, revealed).await;
            }

            cursor = (cursor + chunk).min(total);
            let done = cursor == total;
            let partial: String = self.chars[..cursor].iter().collect();

            match self.write(partial.clone(), done).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        message_id = %self.target.message_id,
                        "Reveal target replaced or finalized, stopping"
                    );
                    self.state.send_replace(RevealState::Cancelled);
                    return RevealOutcome {
                        state: RevealState::Cancelled,
                        ticks,
                        text: revealed,
                    };
                }
                Err(e) => {
                    tracing::error!(error = %e, message_id = %self.target.message_id, "Reveal tick write failed");
                    // The cursor stays at the end, so the next tick retries delivery
                    if done {
                        final_failures += 1;
                        if final_failures >= FINAL_WRITE_ATTEMPTS {
                            tracing::error!(
                                message_id = %self.target.message_id,
                                "Giving up on delivering reply"
                            );
                            self.state.send_replace(RevealState::Cancelled);
                            return RevealOutcome {
                                state: RevealState::Cancelled,
                                ticks,
                                text: revealed,
                            };
                        }
                    }
                    continue;
                }
            }

            ticks += 1;
            revealed = partial;

            self.events.emit(EngineEvent::RevealChunk {
                conversation_id: self.target.conversation_id.clone(),
                message_id: self.target.message_id.clone(),
                text: revealed.clone(),
            });
            if self.pinned.load(Ordering::Relaxed) {
                self.events.emit(EngineEvent::ScrollToEnd {
                    conversation_id: self.target.conversation_id.clone(),
                });
            }

            if done {
                return self.finish(RevealState::Delivered, ticks, revealed);
            }
        }
    }

    /// Cancellation: keep the revealed prefix and mark the message delivered
    async fn stop(self, ticks: usize, revealed: String) -> RevealOutcome {
        let message_id = self.target.message_id.clone();
        let finalized = self
            .store
            .modify(&self.target.conversation_id, |messages| {
                let m = messages
                    .iter_mut()
                    .find(|m| m.id == message_id && !m.is_delivered)?;
                m.is_delivered = true;
                Some(())
            })
            .await;

        if let Err(e) = finalized {
            tracing::error!(error = %e, message_id = %self.target.message_id, "Failed to finalize cancelled reveal");
        }

        tracing::info!(message_id = %self.target.message_id, ticks, "Reveal cancelled");
        self.state.send_replace(RevealState::Cancelled);
        self.events.emit(EngineEvent::MessageDelivered {
            conversation_id: self.target.conversation_id.clone(),
            message_id: self.target.message_id.clone(),
            cancelled: true,
        });

        RevealOutcome {
            state: RevealState::Cancelled,
            ticks,
            text: revealed,
        }
    }

    fn finish(&self, state: RevealState, ticks: usize, text: String) -> RevealOutcome {
        tracing::debug!(message_id = %self.target.message_id, ticks, "Reveal delivered");
        self.state.send_replace(state);
        self.events.emit(EngineEvent::MessageDelivered {
            conversation_id: self.target.conversation_id.clone(),
            message_id: self.target.message_id.clone(),
            cancelled: false,
        });
        RevealOutcome { state, ticks, text }
    }

    /// Store `text` in the target if it is still pending. Returns false when
    /// the target no longer accepts writes.
    async fn write(&self, text: String, deliver: bool) -> Result<bool, StorageError> {
        let message_id = &self.target.message_id;
        let written = self
            .store
            .modify(&self.target.conversation_id, move |messages| {
                let m = messages
                    .iter_mut()
                    .find(|m| &m.id == message_id && !m.is_delivered)?;
                m.text = text;
                m.is_delivered = deliver;
                Some(())
            })
            .await?;
        Ok(written.is_some())
    }
}

/// Successive texts a reveal of `text` stores, one per tick
pub fn reveal_frames(text: &str, chunk: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk = chunk.max(1);
    (1..=chars.len().div_ceil(chunk))
        .map(|tick| chars[..(tick * chunk).min(chars.len())].iter().collect())
        .collect()
}
