use std::io::Write;

use colored::Colorize;
use msagent_core::app::{LoopState, TurnEvent};
use serde_json::Value;
use tokio::sync::mpsc;

const MAX_ARGUMENT_PREVIEW: usize = 80;

/// Formats one turn event for the terminal. `None` means nothing to show.
pub fn format_event(event: &TurnEvent, stream_text: bool) -> Option<String> {
    match event {
        TurnEvent::TextDelta(text) if stream_text => Some(text.clone()),
        TurnEvent::TextDelta(_) | TurnEvent::StateChanged(_) => None,
        TurnEvent::ToolCallStarted {
            name, arguments, ..
        } => Some(format!(
            "\n{} {}({})\n",
            "→".cyan(),
            name.cyan().bold(),
            preview_arguments(arguments).dimmed()
        )),
        TurnEvent::ToolCallFinished { name, is_error, .. } => Some(if *is_error {
            format!("{} {} failed\n", "✗".red(), name)
        } else {
            format!("{} {} done\n", "✓".green(), name)
        }),
        TurnEvent::Warning(message) => Some(format!("{} {}\n", "warning:".yellow(), message)),
    }
}

fn preview_arguments(arguments: &Value) -> String {
    let rendered = match arguments {
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    };
    if rendered.chars().count() > MAX_ARGUMENT_PREVIEW {
        let truncated: String = rendered.chars().take(MAX_ARGUMENT_PREVIEW).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}

/// Writes turn events to stdout until the sender side is dropped.
pub async fn print_events(mut events: mpsc::Receiver<TurnEvent>, stream_text: bool) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        if let TurnEvent::StateChanged(LoopState::Streaming) = event {
            tracing::debug!("model stream opened");
        }
        if let Some(text) = format_event(&event, stream_text) {
            let _ = write!(stdout, "{text}");
            let _ = stdout.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_hidden_when_not_streaming() {
        let event = TurnEvent::TextDelta("hi".to_string());
        assert_eq!(format_event(&event, true), Some("hi".to_string()));
        assert_eq!(format_event(&event, false), None);
    }

    #[test]
    fn long_arguments_are_truncated() {
        let long = "x".repeat(200);
        let preview = preview_arguments(&json!({ "text": long }));
        assert_eq!(preview.chars().count(), MAX_ARGUMENT_PREVIEW + 1);
        assert!(preview.ends_with('…'));
        assert_eq!(preview_arguments(&json!({})), "");
    }

    #[test]
    fn tool_events_name_the_tool() {
        colored::control::set_override(false);
        let started = TurnEvent::ToolCallStarted {
            id: "c1".to_string(),
            name: "read_file".to_string(),
            arguments: json!({"path": "a"}),
        };
        assert_eq!(
            format_event(&started, false).unwrap(),
            "\n→ read_file({\"path\":\"a\"})\n"
        );
        let failed = TurnEvent::ToolCallFinished {
            id: "c1".to_string(),
            name: "read_file".to_string(),
            is_error: true,
        };
        assert_eq!(format_event(&failed, false).unwrap(), "✗ read_file failed\n");
    }
}
