use crate::generation::GenerationOutcome;
use crate::message::Message;
use crate::scheduler::{SchedulerState, Trigger};

/// Everything the front-end needs to render, sent over a flume channel.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(SchedulerState),
    /// Status line for the visible transcript.
    Notice(String),
    AssistantReply {
        trigger: Trigger,
        text: String,
        outcome: GenerationOutcome,
    },
    Notification {
        title: String,
        text: String,
    },
    /// The visible transcript was rebuilt (character switch, import, clear).
    HistoryReplaced(Vec<Message>),
}
