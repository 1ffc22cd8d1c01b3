use std::path::PathBuf;

use companion_core::context::PromptFormat;
use companion_core::events::EngineEvent;
use companion_core::message::{Message, Role};
use companion_core::scheduler::{SchedulerState, Trigger};

pub const HELP: &str = "\
Commands:
  /restart              start a fresh session
  /clear                clear the chat history
  /export <path>        write the conversation to a JSON file
  /import <path>        replace the conversation from a JSON file
  /character <name>     switch character
  /characters           list available characters
  /models               list models on the backend
  /prompt <text>        set a manual system prompt
  /temperature <0-2>    set sampling temperature
  /top_p <0-1>          set nucleus sampling top_p
  /format <name>        prompt format: Plain, <|system|> or ### System
  /settings             show generation settings
  /image <path>         attach an image to your next message
  /proactive on|off     toggle auto messages
  /log                  show the end of the chat log
  /help                 show this help
  /quit                 save and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say(String),
    Restart,
    Clear,
    Export(PathBuf),
    Import(PathBuf),
    Character(String),
    Characters,
    Models,
    Prompt(String),
    Temperature(f32),
    TopP(f32),
    Format(PromptFormat),
    Settings,
    Image(PathBuf),
    Proactive(bool),
    Log,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`; the error is a
/// message for the user.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let require = |usage: &str| -> Result<String, String> {
        if arg.is_empty() {
            Err(format!("Usage: {}", usage))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name.to_lowercase().as_str() {
        "restart" => Command::Restart,
        "clear" => Command::Clear,
        "export" => Command::Export(PathBuf::from(require("/export <path>")?)),
        "import" => Command::Import(PathBuf::from(require("/import <path>")?)),
        "character" => Command::Character(require("/character <name>")?),
        "characters" => Command::Characters,
        "models" => Command::Models,
        "prompt" => Command::Prompt(require("/prompt <text>")?),
        "temperature" => Command::Temperature(parse_unit(
            &require("/temperature <0-2>")?,
            2.0,
            "Usage: /temperature <0-2>",
        )?),
        "top_p" => Command::TopP(parse_unit(
            &require("/top_p <0-1>")?,
            1.0,
            "Usage: /top_p <0-1>",
        )?),
        "format" => {
            let raw = require("/format <Plain|<|system|>|### System>")?;
            match PromptFormat::parse(&raw) {
                Some(format) => Command::Format(format),
                None => return Err(format!("Unknown prompt format '{}'", raw)),
            }
        }
        "settings" => Command::Settings,
        "image" => Command::Image(PathBuf::from(require("/image <path>")?)),
        "proactive" => match arg.to_lowercase().as_str() {
            "on" => Command::Proactive(true),
            "off" => Command::Proactive(false),
            _ => return Err("Usage: /proactive on|off".to_string()),
        },
        "log" => Command::Log,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => {
            return Err(format!(
                "Unknown command '/{}'. Type /help for commands.",
                other
            ))
        }
    };
    Ok(Some(command))
}

fn parse_unit(raw: &str, max: f32, usage: &str) -> Result<f32, String> {
    match raw.parse::<f32>() {
        Ok(value) if (0.0..=max).contains(&value) => Ok(value),
        _ => Err(usage.to_string()),
    }
}

pub fn render_message(message: &Message, character: &str) -> String {
    let speaker = match message.role {
        Role::User => "You",
        Role::Assistant => character,
        Role::System => "System",
    };
    match &message.attachment {
        Some(path) => format!("{}: {} [image: {}]", speaker, message.content, path.display()),
        None => format!("{}: {}", speaker, message.content),
    }
}

/// Text to print for `event`, if any. `character` is the active display name.
pub fn render_event(event: &EngineEvent, character: &str) -> Option<String> {
    match event {
        EngineEvent::StateChanged(SchedulerState::Generating) => {
            Some(format!("({} is typing...)", character))
        }
        EngineEvent::StateChanged(SchedulerState::Idle) => None,
        EngineEvent::Notice(text) => Some(format!("System: {}", text)),
        EngineEvent::AssistantReply { trigger, text, .. } => match trigger {
            Trigger::User => Some(format!("{}: {}", character, text)),
            Trigger::Proactive => Some(format!("{} (auto): {}", character, text)),
        },
        // The reply itself is already printed; ring the terminal bell.
        EngineEvent::Notification { title, .. } => Some(format!("\x07[{}]", title)),
        EngineEvent::HistoryReplaced(messages) => {
            let mut out = String::from("--- conversation ---");
            for message in messages {
                out.push('\n');
                out.push_str(&render_message(message, character));
            }
            Some(out)
        }
    }
}
