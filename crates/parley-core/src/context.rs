use parley_types::ChatMessage;

pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

/// Turns chat history into the single prompt string sent to the model.
///
/// Only the most recent `window` messages are forwarded, counting the message
/// the user is sending now.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
    window: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new("", DEFAULT_CONTEXT_WINDOW)
    }
}

impl ContextBuilder {
    pub fn new(system_prompt: impl Into<String>, window: usize) -> Self {
        Self {
            system_prompt: system_prompt.into().trim().to_string(),
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn window_of<'a>(&self, messages: &'a [ChatMessage]) -> &'a [ChatMessage] {
        let start = messages.len().saturating_sub(self.window);
        &messages[start..]
    }

    pub fn build(&self, history: &[ChatMessage], pending: &ChatMessage) -> String {
        let keep_from_history = self.window - 1;
        let start = history.len().saturating_sub(keep_from_history);
        let mut out = String::new();
        if !self.system_prompt.is_empty() {
            out.push_str(&self.system_prompt);
            out.push_str("\n\n");
        }
        for message in history[start..].iter().chain(std::iter::once(pending)) {
            out.push_str(message.role.label());
            out.push_str(": ");
            out.push_str(message.content.trim());
            out.push('\n');
        }
        out.push_str("Assistant:");
        out
    }
}
