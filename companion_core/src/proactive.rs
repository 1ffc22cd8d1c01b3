//! Background loop that lets the character speak first.
//!
//! The trigger is an explicit `Stopped`/`Running` state machine. The loop
//! checks its stop signal between every sleep and before each attempt, and
//! `stop()` waits a bounded time for the task before aborting it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::collaborators::Notifier;
use crate::context::PromptFormat;
use crate::conversation::ConversationState;
use crate::error::CoreError;
use crate::generation::GenerationParams;
use crate::message::Message;
use crate::notify::{notification_body, notification_title};
use crate::scheduler::{GenerationScheduler, ProactiveAttempt};

/// Reply that means the character has nothing to add.
pub const NOTHING_TO_SAY: &str = "NOTHING_TO_SAY";
pub const MIN_PROACTIVE_CHARS: usize = 4;

pub const PROACTIVE_PARAMS: GenerationParams = GenerationParams {
    temperature: 0.8,
    top_p: 0.9,
    prompt_format: PromptFormat::Plain,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProactiveSettings {
    pub initial_delay: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub error_backoff: Duration,
    pub join_timeout: Duration,
}

impl Default for ProactiveSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            min_interval: Duration::from_secs(45),
            max_interval: Duration::from_secs(90),
            error_backoff: Duration::from_secs(60),
            join_timeout: Duration::from_secs(1),
        }
    }
}

impl ProactiveSettings {
    pub fn next_interval(&self) -> Duration {
        let a = self.min_interval.as_millis() as u64;
        let b = self.max_interval.as_millis() as u64;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Backend messages for one proactive attempt: the system prompt extended with
/// the proactive instructions, followed by the conversation without its
/// original system message.
pub fn build_proactive_messages(state: &ConversationState, now: DateTime<Local>) -> Vec<Message> {
    let instructions = format!(
        "Current time is {}. You may start the conversation if you want to. \
         If the user asked you to write at a specific time, check whether it is that time now \
         and act on it. Otherwise keep continuity with what we have been discussing: \
         do not jump to new topics and do not forget what was said earlier. \
         If there is nothing relevant to add right now and no timed request is due, \
         reply with exactly '{}'.",
        now.format("%H:%M"),
        NOTHING_TO_SAY
    );

    let mut messages = Vec::with_capacity(state.messages.len() + 1);
    messages.push(Message::system(format!(
        "{}\n\n{}",
        state.system_prompt, instructions
    )));
    messages.extend(state.tail().iter().cloned());
    messages
}

pub fn accept_proactive_text(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty()
        && !trimmed.contains(NOTHING_TO_SAY)
        && trimmed.chars().count() >= MIN_PROACTIVE_CHARS
}

struct TriggerInner {
    scheduler: Arc<GenerationScheduler>,
    notifier: Arc<dyn Notifier>,
    settings: ProactiveSettings,
}

impl TriggerInner {
    async fn run_cycle(&self) -> Result<ProactiveAttempt, CoreError> {
        let attempt = self
            .scheduler
            .submit_proactive(
                PROACTIVE_PARAMS,
                |state| build_proactive_messages(state, Local::now()),
                accept_proactive_text,
            )
            .await;

        match attempt {
            ProactiveAttempt::Delivered {
                ref character,
                ref text,
            } => {
                tracing::info!("Proactive message from {}", character);
                self.notifier
                    .notify(&notification_title(character), &notification_body(text));
                Ok(attempt)
            }
            ProactiveAttempt::Failed(e) => Err(e),
            other => Ok(other),
        }
    }
}

enum TriggerState {
    Stopped,
    Running {
        stop_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
}

pub struct ProactiveTrigger {
    inner: Arc<TriggerInner>,
    state: Mutex<TriggerState>,
}

impl ProactiveTrigger {
    pub fn new(
        scheduler: Arc<GenerationScheduler>,
        notifier: Arc<dyn Notifier>,
        settings: ProactiveSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                scheduler,
                notifier,
                settings,
            }),
            state: Mutex::new(TriggerState::Stopped),
        }
    }

    /// Launch the loop. Returns `false` when it was already running.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let TriggerState::Running { handle, .. } = &*state {
            if !handle.is_finished() {
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.inner.clone(), stop_rx));
        *state = TriggerState::Running { stop_tx, handle };
        true
    }

    /// Signal the loop and wait for it, bounded by the join timeout.
    pub async fn stop(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            TriggerState::Stopped,
        );
        let TriggerState::Running { stop_tx, mut handle } = previous else {
            return;
        };

        let _ = stop_tx.send(true);
        if tokio::time::timeout(self.inner.settings.join_timeout, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!("Proactive loop did not stop in time, aborting it");
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            TriggerState::Running { handle, .. } => !handle.is_finished(),
            TriggerState::Stopped => false,
        }
    }

    /// One attempt outside the loop's schedule.
    #[cfg(test)]
    async fn run_once(&self) -> Result<ProactiveAttempt, CoreError> {
        self.inner.run_cycle().await
    }
}

async fn run_loop(inner: Arc<TriggerInner>, mut stop_rx: watch::Receiver<bool>) {
    tracing::info!("Proactive loop starting...");

    if wait_or_stop(&mut stop_rx, inner.settings.initial_delay).await {
        tracing::info!("Proactive loop stopped");
        return;
    }

    loop {
        if wait_or_stop(&mut stop_rx, inner.settings.next_interval()).await {
            break;
        }

        match inner.run_cycle().await {
            Ok(attempt) => tracing::debug!("Proactive attempt: {:?}", attempt),
            Err(e) => {
                tracing::error!("Proactive cycle error: {}", e);
                if wait_or_stop(&mut stop_rx, inner.settings.error_backoff).await {
                    break;
                }
            }
        }
    }

    tracing::info!("Proactive loop stopped");
}

/// Sleep for `delay` unless stopped first. Returns `true` when the loop
/// should exit.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *stop_rx.borrow(),
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}
