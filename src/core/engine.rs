//! Conversation engine
//!
//! The ConversationEngine owns the lifecycle of every exchange:
//! 1. Appends the user message and an empty assistant placeholder
//! 2. Sends the history to the completion gateway
//! 3. Reveals the answer into the placeholder, or finalizes it with the
//!    fallback text when the completion failed
//! 4. Titles the conversation after its first exchange, in a task of its
//!    own that the generation does not wait for
//!
//! At most one generation runs per conversation. Sending while one is in
//! flight is rejected; editing or regenerating cancels it first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::config::{prompts_builtin, Config, FeedbackSettings, RevealSettings};
use crate::conversation::{ChatTurn, Conversation, ConversationSummary, Message, Role};
use crate::providers::{CompletionError, CompletionGateway};
use crate::storage::{KeyValueStore, StorageError};

use super::badges::{BadgeKind, BadgeTimers};
use super::events::{EngineEvent, EventBus};
use super::index::ConversationIndex;
use super::messages::MessageStore;
use super::reveal::{CancelToken, RevealScheduler, RevealTarget};

/// Errors from the conversation engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Message {message_id} not found in conversation {conversation_id}")]
    NotFound {
        conversation_id: String,
        message_id: String,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("A reply is still being generated in conversation {0}")]
    Busy(String),

    #[error("Message {0} is not a user message")]
    NotAUserMessage(String),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Title summarization failed; the conversation is titled "Untitled"
#[derive(Debug, thiserror::Error)]
#[error("Title generation failed: {0}")]
pub struct TitleGenerationError(#[from] CompletionError);

/// Engine settings taken from the application config
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub reveal: RevealSettings,
    pub feedback: FeedbackSettings,
    pub system_prompt: Option<String>,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            reveal: config.reveal,
            feedback: config.feedback,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

/// Ids created by a send, edit or regenerate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    /// True when this call created the conversation
    pub created: bool,
}

/// Result of starting a conversation from a scanned question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReceipt {
    pub conversation_id: String,
    pub message_id: String,
    pub title: String,
}

/// A generation in flight for one conversation
struct Generation {
    id: u64,
    cancel: CancelToken,
    done: watch::Receiver<bool>,
}

/// Everything a generation task needs to know about its exchange
struct GenerationJob {
    conversation_id: String,
    assistant_message_id: String,
    /// Messages before the placeholder
    history: Vec<Message>,
    /// Title the conversation once the reply is known
    retitle: bool,
}

/// The core conversation engine
pub struct ConversationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    messages: Arc<MessageStore>,
    index: ConversationIndex,
    gateway: Arc<dyn CompletionGateway>,
    reveal: RevealScheduler,
    events: EventBus,
    badges: BadgeTimers,
    system_prompt: Option<String>,
    generations: Mutex<HashMap<String, Generation>>,
    /// Latest title request per conversation; older results are dropped
    title_tickets: Mutex<HashMap<String, u64>>,
    viewports: Mutex<HashMap<String, Arc<AtomicBool>>>,
    next_generation: AtomicU64,
}

impl ConversationEngine {
    /// Create a new engine over the given persistence and gateway
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn CompletionGateway>,
        config: EngineConfig,
    ) -> Self {
        let messages = Arc::new(MessageStore::new(kv.clone()));
        let events = EventBus::new();

        Self {
            inner: Arc::new(EngineInner {
                reveal: RevealScheduler::new(messages.clone(), events.clone(), config.reveal),
                messages,
                index: ConversationIndex::new(kv),
                gateway,
                events,
                badges: BadgeTimers::new(config.feedback.badge_duration()),
                system_prompt: config.system_prompt,
                generations: Mutex::new(HashMap::new()),
                title_tickets: Mutex::new(HashMap::new()),
                viewports: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Send a user message. Creates the conversation when no id is given
    /// or the id is not indexed yet.
    pub async fn send(
        &self,
        conversation_id: Option<&str>,
        text: &str,
        image_uri: Option<String>,
    ) -> Result<SendReceipt, EngineError> {
        let text = text.trim();
        if text.is_empty() && image_uri.is_none() {
            return Err(EngineError::EmptyMessage);
        }

        let mut generations = self.inner.generations.lock().await;

        let (conversation_id, summary) = match conversation_id {
            Some(id) => {
                let indexed = self.inner.index.get(id).await?.is_some();
                (id.to_string(), (!indexed).then(|| ConversationSummary::with_id(id)))
            }
            None => {
                let summary = ConversationSummary::new();
                (summary.id.clone(), Some(summary))
            }
        };

        if generations.contains_key(&conversation_id) {
            return Err(EngineError::Busy(conversation_id));
        }

        let created = match summary {
            Some(summary) => {
                tracing::info!(conversation_id = %summary.id, "Creating conversation");
                self.inner.index.prepend(summary).await?
            }
            None => false,
        };

        let user = Message::user(text).with_image(image_uri);
        let placeholder = Message::pending_reply(&user.id);
        let receipt = SendReceipt {
            conversation_id: conversation_id.clone(),
            user_message_id: user.id.clone(),
            assistant_message_id: placeholder.id.clone(),
            created,
        };

        let history = self
            .inner
            .messages
            .update(&conversation_id, |messages| {
                messages.push(user);
                let history = messages.clone();
                messages.push(placeholder);
                history
            })
            .await?;

        // Title after the first exchange of a conversation
        let retitle = history.len() == 1;

        self.spawn_generation(
            &mut generations,
            GenerationJob {
                conversation_id,
                assistant_message_id: receipt.assistant_message_id.clone(),
                history,
                retitle,
            },
        );

        Ok(receipt)
    }

    /// Replace a user message and everything after it with an edited copy
    /// and a fresh reply.
    pub async fn edit_and_resend(
        &self,
        conversation_id: &str,
        target_user_message_id: &str,
        new_text: &str,
    ) -> Result<SendReceipt, EngineError> {
        let new_text = new_text.trim().to_string();
        if new_text.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        // Any reveal still running would write into messages we discard
        self.stop_generating(conversation_id).await?;

        let mut generations = self.inner.generations.lock().await;
        if generations.contains_key(conversation_id) {
            return Err(EngineError::Busy(conversation_id.to_string()));
        }

        let (position, edited, placeholder, history) = self
            .inner
            .messages
            .try_update(conversation_id, |messages| {
                let position = messages
                    .iter()
                    .position(|m| m.id == target_user_message_id)
                    .ok_or_else(|| EngineError::NotFound {
                        conversation_id: conversation_id.to_string(),
                        message_id: target_user_message_id.to_string(),
                    })?;
                if messages[position].role != Role::User {
                    return Err(EngineError::NotAUserMessage(
                        target_user_message_id.to_string(),
                    ));
                }

                let mut edited = messages[position].clone();
                edited.text = new_text;
                messages.truncate(position);
                messages.push(edited.clone());
                let history = messages.clone();

                let placeholder = Message::pending_reply(&edited.id);
                messages.push(placeholder.clone());
                Ok((position, edited, placeholder, history))
            })
            .await?;

        tracing::info!(
            conversation_id,
            message_id = %edited.id,
            position,
            "Resending edited message"
        );

        let receipt = SendReceipt {
            conversation_id: conversation_id.to_string(),
            user_message_id: edited.id,
            assistant_message_id: placeholder.id,
            created: false,
        };

        self.spawn_generation(
            &mut generations,
            GenerationJob {
                conversation_id: conversation_id.to_string(),
                assistant_message_id: receipt.assistant_message_id.clone(),
                history,
                retitle: position == 0,
            },
        );

        Ok(receipt)
    }

    /// Produce a new reply for the user message behind an assistant message
    pub async fn regenerate(
        &self,
        conversation_id: &str,
        assistant_message_id: &str,
    ) -> Result<SendReceipt, EngineError> {
        let messages = self.inner.messages.load_or_empty(conversation_id).await?;
        let not_found = || EngineError::NotFound {
            conversation_id: conversation_id.to_string(),
            message_id: assistant_message_id.to_string(),
        };

        let position = messages
            .iter()
            .position(|m| m.id == assistant_message_id && m.role == Role::Assistant)
            .ok_or_else(not_found)?;

        let linked = messages[position]
            .original_user_message_id
            .as_deref()
            .and_then(|id| messages.iter().find(|m| m.id == id));
        let user = linked
            .or_else(|| {
                messages[..position]
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
            })
            .ok_or_else(not_found)?;

        self.edit_and_resend(conversation_id, &user.id, &user.text)
            .await
    }

    /// Stop the generation in flight, keeping whatever has been revealed.
    /// Returns false when nothing was running.
    pub async fn stop_generating(&self, conversation_id: &str) -> Result<bool, EngineError> {
        let running = {
            let generations = self.inner.generations.lock().await;
            generations
                .get(conversation_id)
                .map(|g| (g.cancel.clone(), g.done.clone()))
        };

        let Some((cancel, mut done)) = running else {
            return Ok(false);
        };

        tracing::info!(conversation_id, "Stopping generation");
        cancel.cancel();
        let _ = done.wait_for(|finished| *finished).await;
        Ok(true)
    }

    /// Resolves once no generation is running for the conversation
    pub async fn wait_until_idle(&self, conversation_id: &str) {
        let done = {
            let generations = self.inner.generations.lock().await;
            generations.get(conversation_id).map(|g| g.done.clone())
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub async fn is_generating(&self, conversation_id: &str) -> bool {
        self.inner
            .generations
            .lock()
            .await
            .contains_key(conversation_id)
    }

    /// Ordered messages for rendering.
    ///
    /// Undelivered messages of an idle conversation were left behind by an
    /// interrupted run; they are finalized here so they never spin forever.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, EngineError> {
        let generations = self.inner.generations.lock().await;
        let messages = self.inner.messages.load_or_empty(conversation_id).await?;

        if generations.contains_key(conversation_id) || !messages.iter().any(Message::is_in_flight) {
            return Ok(messages);
        }

        tracing::warn!(conversation_id, "Finalizing stale undelivered messages");
        let recovered = self
            .inner
            .messages
            .update(conversation_id, |messages| {
                for m in messages.iter_mut().filter(|m| m.is_in_flight()) {
                    if m.text.is_empty() {
                        m.text = prompts_builtin::ERROR_REPLY.to_string();
                    }
                    m.is_delivered = true;
                }
                messages.clone()
            })
            .await?;
        Ok(recovered)
    }

    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        let summary = self.inner.index.get(conversation_id).await?;
        let messages = self.messages(conversation_id).await?;

        if summary.is_none() && messages.is_empty() {
            return Err(EngineError::ConversationNotFound(conversation_id.to_string()));
        }

        Ok(Conversation {
            id: conversation_id.to_string(),
            title: summary.as_ref().and_then(|s| s.title.clone()),
            date: summary.map(|s| s.date),
            messages,
            is_generating: self.is_generating(conversation_id).await,
        })
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, EngineError> {
        Ok(self.inner.index.list().await?)
    }

    /// Toggle a like. Returns the new feedback state.
    pub async fn like(&self, conversation_id: &str, message_id: &str) -> Result<Option<bool>, EngineError> {
        self.react(conversation_id, message_id, true).await
    }

    /// Toggle a dislike. Returns the new feedback state.
    pub async fn dislike(&self, conversation_id: &str, message_id: &str) -> Result<Option<bool>, EngineError> {
        self.react(conversation_id, message_id, false).await
    }

    /// Text to put on the clipboard; raises the "copied" badge
    pub async fn copy(&self, conversation_id: &str, message_id: &str) -> Result<String, EngineError> {
        let text = self.message_text(conversation_id, message_id).await?;
        self.inner.badges.raise(message_id, BadgeKind::Copied).await;
        Ok(text)
    }

    /// Text to hand to the share sheet; raises the "shared" badge
    pub async fn share(&self, conversation_id: &str, message_id: &str) -> Result<String, EngineError> {
        let text = self.message_text(conversation_id, message_id).await?;
        self.inner.badges.raise(message_id, BadgeKind::Shared).await;
        Ok(text)
    }

    pub async fn badge_active(&self, message_id: &str, kind: BadgeKind) -> bool {
        self.inner.badges.is_active(message_id, kind).await
    }

    /// Whether the client is showing the latest message. While pinned,
    /// every revealed chunk is followed by a scroll-to-end event.
    pub async fn set_viewport_pinned(&self, conversation_id: &str, pinned: bool) {
        self.inner
            .viewport(conversation_id)
            .await
            .store(pinned, Ordering::Relaxed);
    }

    pub async fn viewport_pinned(&self, conversation_id: &str) -> bool {
        self.inner.viewport(conversation_id).await.load(Ordering::Relaxed)
    }

    /// Start a conversation from a scanned question. The scan result is the
    /// first, already delivered, assistant message.
    pub async fn start_from_scan(
        &self,
        scan_text: &str,
        image_uri: Option<String>,
    ) -> Result<ScanReceipt, EngineError> {
        let scan_text = scan_text.trim();
        if scan_text.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        let summary = ConversationSummary::new();
        let conversation_id = summary.id.clone();
        let message = Message::delivered_reply(scan_text).with_image(image_uri);
        let message_id = message.id.clone();

        self.inner.index.prepend(summary).await?;
        self.inner.messages.save(&conversation_id, &[message]).await?;
        tracing::info!(conversation_id = %conversation_id, "Conversation started from scan");

        let title = self.inner.generate_title(&[], scan_text).await;
        self.inner.set_title(&conversation_id, &title).await;

        Ok(ScanReceipt {
            conversation_id,
            message_id,
            title,
        })
    }

    /// Index every stored conversation log that has no index entry.
    /// Returns how many entries were added.
    pub async fn repair_index(&self) -> Result<usize, EngineError> {
        let indexed: Vec<String> = self
            .inner
            .index
            .list()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let mut missing: Vec<String> = self
            .inner
            .messages
            .conversation_ids()
            .await?
            .into_iter()
            .filter(|id| !indexed.contains(id))
            .collect();
        // Prepend oldest first so the newest ends up at the head
        missing.sort_by_key(|id| id.parse::<i64>().unwrap_or(i64::MIN));

        for id in &missing {
            tracing::warn!(conversation_id = %id, "Re-indexing conversation without index entry");
            self.inner
                .index
                .prepend(ConversationSummary::recovered(id, prompts_builtin::UNTITLED))
                .await?;
        }
        Ok(missing.len())
    }

    async fn react(
        &self,
        conversation_id: &str,
        message_id: &str,
        like: bool,
    ) -> Result<Option<bool>, EngineError> {
        let feedback = self
            .inner
            .messages
            .try_update(conversation_id, |messages| {
                let message = messages
                    .iter_mut()
                    .find(|m| m.id == message_id)
                    .ok_or_else(|| EngineError::NotFound {
                        conversation_id: conversation_id.to_string(),
                        message_id: message_id.to_string(),
                    })?;
                message.liked = if message.liked == Some(like) {
                    None
                } else {
                    Some(like)
                };
                Ok::<_, EngineError>(message.liked)
            })
            .await?;

        if let Some(liked) = feedback {
            let kind = if liked { BadgeKind::Liked } else { BadgeKind::Disliked };
            self.inner.badges.raise(message_id, kind).await;
        }
        Ok(feedback)
    }

    async fn message_text(&self, conversation_id: &str, message_id: &str) -> Result<String, EngineError> {
        self.inner
            .messages
            .load_or_empty(conversation_id)
            .await?
            .into_iter()
            .find(|m| m.id == message_id)
            .map(|m| m.text)
            .ok_or_else(|| EngineError::NotFound {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            })
    }

    /// Register and spawn a generation. The caller holds the generations
    /// lock, so the busy check and the registration are one step.
    fn spawn_generation(&self, generations: &mut HashMap<String, Generation>, job: GenerationJob) {
        let id = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        generations.insert(
            job.conversation_id.clone(),
            Generation {
                id,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let conversation_id = job.conversation_id.clone();
            let assistant_message_id = job.assistant_message_id.clone();

            let run = tokio::spawn({
                let inner = inner.clone();
                async move { inner.run_generation(job, cancel).await }
            });
            if let Err(e) = run.await {
                tracing::error!(error = %e, conversation_id = %conversation_id, "Generation task failed");
                inner
                    .finalize(&conversation_id, &assistant_message_id, Some(prompts_builtin::ERROR_REPLY))
                    .await;
            }

            inner.retire(&conversation_id, id).await;
            done_tx.send_replace(true);
        });
    }
}

impl EngineInner {
    async fn run_generation(self: Arc<Self>, job: GenerationJob, cancel: CancelToken) {
        let turns = self.completion_turns(&job.history);

        tracing::info!(
            conversation_id = %job.conversation_id,
            message_id = %job.assistant_message_id,
            turns = turns.len(),
            "Requesting reply"
        );

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.gateway.complete(&turns) => Some(result),
        };

        let reply = match completion {
            None => {
                tracing::info!(conversation_id = %job.conversation_id, "Stopped before the reply arrived");
                self.finalize(&job.conversation_id, &job.assistant_message_id, None)
                    .await;
                None
            }
            Some(Err(e)) => {
                tracing::warn!(conversation_id = %job.conversation_id, error = %e, "Completion failed");
                self.finalize(
                    &job.conversation_id,
                    &job.assistant_message_id,
                    Some(prompts_builtin::ERROR_REPLY),
                )
                .await;
                None
            }
            Some(Ok(reply)) => Some(reply),
        };

        let Some(reply) = reply else {
            if job.retitle {
                let ticket = self.claim_title(&job.conversation_id).await;
                self.set_title_if_current(&job.conversation_id, ticket, prompts_builtin::UNTITLED)
                    .await;
            }
            return;
        };

        if job.retitle {
            self.spawn_title(&job.conversation_id, &job.history, &reply)
                .await;
        }

        let pinned = self.viewport(&job.conversation_id).await;
        let handle = self.reveal.start(
            RevealTarget {
                conversation_id: job.conversation_id.clone(),
                message_id: job.assistant_message_id.clone(),
            },
            reply,
            cancel,
            pinned,
        );

        let outcome = handle.join().await;
        tracing::info!(
            conversation_id = %job.conversation_id,
            ticks = outcome.ticks,
            state = ?outcome.state,
            "Reply finished"
        );
    }

    /// History as sent to the gateway, led by the system instruction
    fn completion_turns(&self, history: &[Message]) -> Vec<ChatTurn> {
        let mut turns = Vec::with_capacity(history.len() + 1);
        if let Some(ref prompt) = self.system_prompt {
            turns.push(ChatTurn::system(prompt.clone()));
        }
        turns.extend(
            history
                .iter()
                .filter(|m| !m.text.is_empty())
                .map(ChatTurn::from),
        );
        turns
    }

    /// Summarize a title in the background. The generation does not wait
    /// for it, so a slow summarizer never holds the conversation busy.
    async fn spawn_title(self: &Arc<Self>, conversation_id: &str, history: &[Message], reply: &str) {
        let ticket = self.claim_title(conversation_id).await;
        let inner = self.clone();
        let conversation_id = conversation_id.to_string();
        let turns: Vec<ChatTurn> = history.iter().map(ChatTurn::from).collect();
        let reply = reply.to_string();

        tokio::spawn(async move {
            let title = inner.generate_title(&turns, &reply).await;
            inner
                .set_title_if_current(&conversation_id, ticket, &title)
                .await;
        });
    }

    async fn claim_title(&self, conversation_id: &str) -> u64 {
        let ticket = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.title_tickets
            .lock()
            .await
            .insert(conversation_id.to_string(), ticket);
        ticket
    }

    async fn set_title_if_current(&self, conversation_id: &str, ticket: u64, title: &str) {
        let tickets = self.title_tickets.lock().await;
        if tickets.get(conversation_id) != Some(&ticket) {
            tracing::debug!(conversation_id, "Dropping superseded title");
            return;
        }
        self.set_title(conversation_id, title).await;
    }

    async fn generate_title(&self, history: &[ChatTurn], reply: &str) -> String {
        match self
            .gateway
            .summarize_title(history, reply)
            .await
            .map_err(TitleGenerationError::from)
        {
            Ok(title) => title,
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to default title");
                prompts_builtin::UNTITLED.to_string()
            }
        }
    }

    async fn set_title(&self, conversation_id: &str, title: &str) {
        match self.index.upsert_title(conversation_id, title).await {
            Ok(true) => self.events.emit(EngineEvent::TitleUpdated {
                conversation_id: conversation_id.to_string(),
                title: title.to_string(),
            }),
            Ok(false) => {
                tracing::debug!(conversation_id, "No index entry to title");
            }
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "Failed to store title");
            }
        }
    }

    /// Mark the placeholder delivered without a reveal. `text` replaces its
    /// content when given.
    async fn finalize(&self, conversation_id: &str, message_id: &str, text: Option<&str>) {
        let result = self
            .messages
            .modify(conversation_id, |messages| {
                let m = messages
                    .iter_mut()
                    .find(|m| m.id == message_id && m.is_in_flight())?;
                if let Some(text) = text {
                    m.text = text.to_string();
                }
                m.is_delivered = true;
                Some(())
            })
            .await;

        match result {
            Ok(Some(())) => self.events.emit(EngineEvent::MessageDelivered {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                cancelled: text.is_none(),
            }),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(conversation_id, message_id, error = %e, "Failed to finalize reply");
            }
        }
    }

    async fn retire(&self, conversation_id: &str, generation: u64) {
        let mut generations = self.generations.lock().await;
        if generations.get(conversation_id).map(|g| g.id) == Some(generation) {
            generations.remove(conversation_id);
        }
    }

    async fn viewport(&self, conversation_id: &str) -> Arc<AtomicBool> {
        self.viewports
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(true)))
            .clone()
    }
}
