//! Job messages.
//!
//! Each message is one tag whose title is its kind:
//!
//! ```text
//! <warn time="1700000000000000" text="Buffer almost full"/>
//! ```

use crate::error::Result;
use crate::store::xml::Tag;
use crate::store::Time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical error.
    Critical,
    /// Broadcast from an operator.
    Broadcast,
    /// Stored with a title this version does not know.
    Unknown,
}

impl MessageKind {
    /// Tag title used on disk.
    pub fn tag_name(self) -> &'static str {
        match self {
            MessageKind::Info => "info",
            MessageKind::Warning => "warn",
            MessageKind::Error => "error",
            MessageKind::Critical => "crit_error",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Unknown => "unknown",
        }
    }

    /// Kind for a tag title.
    pub fn from_tag_name(name: &str) -> Self {
        match name {
            "info" => MessageKind::Info,
            "warn" => MessageKind::Warning,
            "error" => MessageKind::Error,
            "crit_error" => MessageKind::Critical,
            "broadcast" => MessageKind::Broadcast,
            _ => MessageKind::Unknown,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// A timestamped job message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Time of the message.
    pub time: Time,
    /// Severity.
    pub kind: MessageKind,
    /// Message text.
    pub text: String,
}

impl Message {
    /// Creates a message.
    pub fn new(time: Time, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            time,
            kind,
            text: text.into(),
        }
    }

    /// Renders the message line, including the trailing newline.
    pub fn render(&self) -> String {
        let mut line = Tag::single(self.kind.tag_name())
            .with_attr("time", self.time)
            .with_attr("text", &self.text)
            .to_string();
        line.push('\n');
        line
    }

    /// Builds a message from a parsed tag. A missing text is empty.
    pub fn from_tag(tag: &Tag, context: &Path) -> Result<Self> {
        Ok(Self {
            time: tag.parse_attr("time", context)?,
            kind: MessageKind::from_tag_name(tag.title()),
            text: tag.attr("text").unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::xml::{parse_tag, Parsed};

    #[test]
    fn test_message_tag() {
        let message = Message::new(42, MessageKind::Critical, "a \"quoted\" <text>");
        let line = message.render();
        assert!(line.starts_with("<crit_error time=\"42\""));

        let Parsed::Tag(tag, _) = parse_tag(&line).unwrap() else {
            panic!("incomplete");
        };
        assert_eq!(Message::from_tag(&tag, Path::new("messages")).unwrap(), message);
    }

    #[test]
    fn test_unknown_kind() {
        let Parsed::Tag(tag, _) = parse_tag("<shout time=\"1\"/>").unwrap() else {
            panic!("incomplete");
        };
        let message = Message::from_tag(&tag, Path::new("messages")).unwrap();
        assert_eq!(message.kind, MessageKind::Unknown);
        assert!(message.text.is_empty());
    }
}
