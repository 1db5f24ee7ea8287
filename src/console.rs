//! Line-oriented console front end
//!
//! Plain lines are questions; lines starting with `/` are commands.

use crate::config::TtsProviderKind;
use crate::llm::{ChatMessage, Role};
use crate::session::UiCommand;

/// Chat models offered by `/help`
pub const MODELS: &[&str] = &["gpt-4o-mini", "gpt-4o", "yi-large", "hunyuan"];

/// Voices the configured synthesis provider accepts for `/tone`
#[must_use]
pub const fn tones(provider: TtsProviderKind) -> &'static [&'static str] {
    match provider {
        TtsProviderKind::OpenAI => &[
            "alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer",
        ],
        // Premade voice ids: Rachel, Sarah, Adam
        TtsProviderKind::ElevenLabs => &[
            "21m00Tcm4TlvDq8ikWAM",
            "EXAVITQu4vr4xnAfbQcK",
            "pNInz6obpgDQGcFmaJgB",
        ],
    }
}

/// Emotion tags offered by `/help`
pub const EMOTIONS: &[&str] = &["neutral", "angry", "exciting", "amaze"];

/// What a console line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    /// Forward to the session
    Command(UiCommand),
    /// Start recording, or stop and ask if already recording
    ToggleRecording,
    /// Print the conversation so far
    History,
    Help,
    Quit,
    /// Nothing to do (blank line)
    Empty,
    /// Unknown command or missing argument
    Invalid(String),
}

/// Parse one line of console input
#[must_use]
pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleInput::Empty;
    }

    let Some(command) = line.strip_prefix('/') else {
        return ConsoleInput::Command(UiCommand::Question(line.to_string()));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    let with_arg = |make: fn(String) -> UiCommand| {
        if arg.is_empty() {
            ConsoleInput::Invalid(format!("/{name} needs a value"))
        } else {
            ConsoleInput::Command(make(arg.to_string()))
        }
    };

    match name {
        "model" => with_arg(UiCommand::Model),
        "tone" => with_arg(UiCommand::Tone),
        "emotion" => with_arg(UiCommand::Emotion),
        "rec" => ConsoleInput::ToggleRecording,
        "cancel" => ConsoleInput::Command(UiCommand::Cancel),
        "history" => ConsoleInput::History,
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        other => ConsoleInput::Invalid(format!("unknown command /{other}")),
    }
}

/// Help text listing commands and the known catalogs
#[must_use]
pub fn help_text(provider: TtsProviderKind) -> String {
    format!(
        "Type a question and press enter, or:\n  \
         /model <name>     models: {}\n  \
         /tone <id>        tones: {}\n  \
         /emotion <tag>    emotions: {}\n  \
         /rec              start or stop recording a question\n  \
         /cancel           stop the current answer\n  \
         /history          show the conversation\n  \
         /quit             exit",
        MODELS.join(", "),
        tones(provider).join(", "),
        EMOTIONS.join(", "),
    )
}

/// Render history one message per line
#[must_use]
pub fn format_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::System => "system",
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            format!("{who}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(
            parse_line("  出师表讲了什么？ "),
            ConsoleInput::Command(UiCommand::Question("出师表讲了什么？".to_string()))
        );
        assert_eq!(parse_line("   "), ConsoleInput::Empty);
    }

    #[test]
    fn settings_commands_take_values() {
        assert_eq!(
            parse_line("/model gpt-4o"),
            ConsoleInput::Command(UiCommand::Model("gpt-4o".to_string()))
        );
        assert_eq!(
            parse_line("/emotion   angry"),
            ConsoleInput::Command(UiCommand::Emotion("angry".to_string()))
        );
        assert!(matches!(parse_line("/tone"), ConsoleInput::Invalid(_)));
    }

    #[test]
    fn control_commands() {
        assert_eq!(parse_line("/rec"), ConsoleInput::ToggleRecording);
        assert_eq!(parse_line("/cancel"), ConsoleInput::Command(UiCommand::Cancel));
        assert_eq!(parse_line("/quit"), ConsoleInput::Quit);
        assert!(matches!(parse_line("/bogus"), ConsoleInput::Invalid(_)));
    }

    #[test]
    fn history_lines() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert_eq!(format_history(&history), "you: hi\nassistant: hello");
    }

    #[test]
    fn help_lists_voices_of_the_configured_provider() {
        let openai = help_text(TtsProviderKind::OpenAI);
        assert!(openai.contains("alloy"));
        assert!(!openai.contains("21m00Tcm4TlvDq8ikWAM"));

        let elevenlabs = help_text(TtsProviderKind::ElevenLabs);
        assert!(elevenlabs.contains("21m00Tcm4TlvDq8ikWAM"));
        assert!(!elevenlabs.contains("alloy"));
    }
}
