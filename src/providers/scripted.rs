//! Scripted gateway for tests - replays queued replies and titles.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::conversation::ChatTurn;

use super::{CompletionError, CompletionGateway};

/// Gateway that answers from a queue and records every request.
///
/// An exhausted queue answers with an error, so forgotten replies show up
/// as fallback text rather than hanging a test.
#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    titles: Mutex<VecDeque<Result<String, CompletionError>>>,
    delay: Duration,
    title_delay: Duration,
    calls: Mutex<Vec<Vec<ChatTurn>>>,
    title_calls: Mutex<Vec<(Vec<ChatTurn>, String)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
        self
    }

    pub fn fail(self) -> Self {
        self.replies.lock().unwrap().push_back(Err(CompletionError::Status {
            status: 503,
            body: "service unavailable".into(),
        }));
        self
    }

    pub fn title(self, title: &str) -> Self {
        self.titles.lock().unwrap().push_back(Ok(title.to_string()));
        self
    }

    pub fn fail_title(self) -> Self {
        self.titles
            .lock()
            .unwrap()
            .push_back(Err(CompletionError::NoChoices));
        self
    }

    /// Delay every completion by the given number of milliseconds
    pub fn with_millis(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    /// Delay every title summary by the given number of milliseconds
    pub fn with_title_millis(mut self, millis: u64) -> Self {
        self.title_delay = Duration::from_millis(millis);
        self
    }

    pub fn calls(&self) -> Vec<Vec<ChatTurn>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn title_calls(&self) -> Vec<(Vec<ChatTurn>, String)> {
        self.title_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, history: &[ChatTurn]) -> Result<String, CompletionError> {
        self.calls.lock().unwrap().push(history.to_vec());
        sleep(self.delay).await;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::InvalidResponse("script exhausted".into())))
    }

    async fn summarize_title(
        &self,
        history: &[ChatTurn],
        generated_reply: &str,
    ) -> Result<String, CompletionError> {
        self.title_calls
            .lock()
            .unwrap()
            .push((history.to_vec(), generated_reply.to_string()));
        // Taken before the delay so titles pair with requests in call order
        let title = self
            .titles
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::EmptyTitle));
        if !self.title_delay.is_zero() {
            sleep(self.title_delay).await;
        }
        title
    }
}
