use crate::tools::{ConnectionState, ServerSummary};

const BASE_PROMPT: &str = "You are msagent, a helpful assistant that can use tools to help users.

When you need to use a tool, respond with a tool call in the appropriate format.
When you receive tool results, incorporate them into your response naturally.
If a tool result reports an error, decide whether to retry with different arguments or explain the problem.";

/// Builds the system prompt sent ahead of every model request.
///
/// Lists the tool servers that are currently usable; a configured custom
/// prompt is appended after the generated part.
pub fn system_prompt(servers: &[ServerSummary], custom: Option<&str>) -> String {
    let connected: Vec<&str> = servers
        .iter()
        .filter(|server| server.state != ConnectionState::Closed)
        .map(|server| server.name.as_str())
        .collect();

    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\nAvailable MCP servers: ");
    if connected.is_empty() {
        prompt.push_str("None");
    } else {
        prompt.push_str(&connected.join(", "));
    }
    prompt.push_str("\n\nBe concise, helpful, and friendly in your responses.");

    if let Some(custom) = custom.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(custom);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, state: ConnectionState) -> ServerSummary {
        ServerSummary {
            name: name.to_string(),
            state,
            tools: vec![],
        }
    }

    #[test]
    fn lists_only_live_servers() {
        let prompt = system_prompt(
            &[
                server("files", ConnectionState::Ready),
                server("gone", ConnectionState::Closed),
                server("slow", ConnectionState::Degraded),
            ],
            None,
        );
        assert!(prompt.contains("Available MCP servers: files, slow"));
        assert!(!prompt.contains("gone"));
    }

    #[test]
    fn no_servers_and_custom_suffix() {
        let prompt = system_prompt(&[], Some("  Answer in French.  "));
        assert!(prompt.contains("Available MCP servers: None"));
        assert!(prompt.ends_with("\n\nAnswer in French."));
    }
}
