//! Plain-text rendering of messages and search result groups.

use crate::models::MessageView;
use crate::search::ResultGroup;

/// Best available label for a message's sender.
pub fn sender_label(message: &MessageView) -> &str {
    message
        .sender_name
        .as_deref()
        .or(message.sender_email.as_deref())
        .or(message.sender_placeholder.as_deref())
        .unwrap_or("Unknown")
}

/// Compact single-line text; start multi-line text on its own line.
pub fn normalize_whitespace(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.contains('\n') {
        let lines: Vec<&str> = trimmed.lines().map(str::trim_end).collect();
        format!("\n{}", lines.join("\n"))
    } else {
        trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// `2018-08-02 10:15:00 (export) Alice Example: hello`
pub fn message_line(message: &MessageView) -> String {
    let body = if message.text.trim().is_empty() {
        message.html.as_deref().unwrap_or("")
    } else {
        message.text.as_str()
    };
    format!(
        "{} ({}) {}: {}",
        message.rendered_timestamp(),
        message.backend,
        sender_label(message),
        normalize_whitespace(body)
    )
}

pub fn conversation_header(message: &MessageView) -> String {
    let name = match (&message.conversation_name, message.is_group) {
        (Some(name), _) => name.as_str(),
        (None, true) => "group conversation",
        (None, false) => "private conversation",
    };
    format!(
        "── {}:{} · {} (#{})",
        message.backend, message.account, name, message.conversation_id
    )
}

pub fn render_groups(groups: &[ResultGroup]) -> String {
    let mut out = String::new();
    for (i, group) in groups.iter().enumerate() {
        let Some(first) = group.messages.first() else {
            continue;
        };
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&conversation_header(&first.message));
        out.push('\n');
        if let Some(omitted) = group.omitted_before.filter(|n| *n > 0) {
            out.push_str(&format!(
                "── {} message{} omitted\n",
                omitted,
                if omitted == 1 { "" } else { "s" }
            ));
        }
        for m in &group.messages {
            out.push_str(if m.is_match { "* " } else { "  " });
            out.push_str(&message_line(&m.message));
            out.push('\n');
        }
    }
    out
}

pub fn render_summary(groups: &[ResultGroup]) -> String {
    let hits: usize = groups
        .iter()
        .map(|g| g.messages.iter().filter(|m| m.is_match).count())
        .sum();
    format!(
        "{} matching message{} in {} group{}",
        hits,
        if hits == 1 { "" } else { "s" },
        groups.len(),
        if groups.len() == 1 { "" } else { "s" }
    )
}
