//! Prompt assembly and outbound text cleanup.

use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;

use crate::storage::StoredMessage;

static INTERNAL_SPAN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)<internal>.*?</internal>").ok());

/// Render messages as the XML-ish transcript agents are prompted with.
pub fn format_messages(messages: &[StoredMessage]) -> String {
    let mut out = String::from("<messages>\n");
    for message in messages {
        let sender = if message.sender_name.trim().is_empty() {
            &message.sender
        } else {
            &message.sender_name
        };
        let time = DateTime::from_timestamp_millis(message.timestamp)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "<message sender=\"{}\" time=\"{}\">{}</message>",
            escape_xml(sender),
            time,
            escape_xml(&message.content)
        );
    }
    out.push_str("</messages>");
    out
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Remove `<internal>` spans and surrounding whitespace.
///
/// An empty result means there is nothing to deliver.
pub fn strip_internal(text: &str) -> String {
    match INTERNAL_SPAN.as_ref() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}
