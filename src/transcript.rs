use crate::messages::{ChatMessage, Role};
use crate::sink::SharedSink;

/// Ordered conversation, append-only for the session
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new(system_prompt: Option<&str>) -> Self {
        let messages = system_prompt
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(|prompt| vec![ChatMessage::system(prompt)])
            .unwrap_or_default();

        Self { messages }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "You",
        Role::Assistant => "Assistant",
    }
}

fn format_message(role: Role, content: &str) -> Vec<String> {
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    lines[0] = format!("{}: {}", label(role), lines[0]);
    lines
}

/// Renders the conversation into a line sink, rewriting the in-flight reply
/// as tokens arrive
pub struct TranscriptView {
    sink: SharedSink,
    reply: Option<PendingReply>,
}

struct PendingReply {
    first_line: usize,
    line_count: usize,
    text: String,
}

impl TranscriptView {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink, reply: None }
    }

    pub fn push_message(&mut self, role: Role, content: &str) {
        self.sink
            .borrow_mut()
            .append_lines(&format_message(role, content));
    }

    pub fn notice(&mut self, text: &str) {
        self.sink.borrow_mut().append_lines(&[format!("-- {}", text)]);
    }

    pub fn begin_reply(&mut self) {
        let lines = format_message(Role::Assistant, "");
        let mut sink = self.sink.borrow_mut();
        let first_line = sink.line_count();
        sink.append_lines(&lines);
        self.reply = Some(PendingReply {
            first_line,
            line_count: lines.len(),
            text: String::new(),
        });
    }

    pub fn append_reply(&mut self, token: &str) {
        let Some(reply) = self.reply.as_mut() else {
            return;
        };

        reply.text.push_str(token);
        let lines = format_message(Role::Assistant, &reply.text);
        self.sink.borrow_mut().set_lines(
            reply.first_line,
            reply.first_line + reply.line_count,
            &lines,
        );
        reply.line_count = lines.len();
    }

    pub fn end_reply(&mut self) {
        self.reply = None;
    }
}
