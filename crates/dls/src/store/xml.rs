//! Minimal XML tag codec for `channel.xml`, `chunk.xml` and block records.
//!
//! Only the subset the store writes is supported: begin tags, end tags and
//! self-closing tags with double-quoted attributes. No text content, no
//! comments, no namespaces.

use crate::error::{DlsError, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Kind of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// `<title ...>`
    Begin,
    /// `</title>`
    End,
    /// `<title .../>`
    Single,
}

/// One parsed or to-be-written tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    title: String,
    kind: TagKind,
    attrs: Vec<(String, String)>,
}

impl Tag {
    /// Creates a tag without attributes.
    pub fn new(title: impl Into<String>, kind: TagKind) -> Self {
        Self {
            title: title.into(),
            kind,
            attrs: Vec::new(),
        }
    }

    /// Creates a self-closing tag.
    pub fn single(title: impl Into<String>) -> Self {
        Self::new(title, TagKind::Single)
    }

    /// Appends an attribute (builder style).
    pub fn with_attr(mut self, name: &str, value: impl ToString) -> Self {
        self.push_attr(name, value);
        self
    }

    /// Appends an attribute.
    pub fn push_attr(&mut self, name: &str, value: impl ToString) {
        self.attrs.push((name.to_string(), value.to_string()));
    }

    /// Tag title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Tag kind.
    pub fn kind(&self) -> TagKind {
        self.kind
    }

    /// Looks up an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Looks up and parses a required attribute.
    ///
    /// `context` names the file or stream for the error message.
    pub fn parse_attr<T: FromStr>(&self, name: &str, context: &Path) -> Result<T> {
        let raw = self.attr(name).ok_or_else(|| {
            DlsError::corrupt(
                context,
                format!("tag <{}> lacks attribute \"{}\"", self.title, name),
            )
        })?;
        raw.parse().map_err(|_| {
            DlsError::corrupt(
                context,
                format!("attribute {}=\"{}\" of <{}> is invalid", name, raw, self.title),
            )
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == TagKind::End {
            return write!(f, "</{}>", self.title);
        }
        write!(f, "<{}", self.title)?;
        for (name, value) in &self.attrs {
            write!(f, " {}=\"{}\"", name, escape(value))?;
        }
        match self.kind {
            TagKind::Single => f.write_str("/>"),
            _ => f.write_str(">"),
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> std::result::Result<String, String> {
    if !value.contains('&') {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| format!("unterminated entity in \"{}\"", value))?;
        let entity = &rest[amp + 1..amp + semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            "#10" => out.push('\n'),
            other => return Err(format!("unknown entity &{};", other)),
        }
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Outcome of parsing from a possibly incomplete buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A tag and the number of bytes consumed, including leading whitespace.
    Tag(Tag, usize),
    /// The buffer ends before the tag does.
    Incomplete,
}

/// Parses the first tag in `input`.
///
/// Returns [`Parsed::Incomplete`] when more bytes are needed, so callers can
/// feed a growing buffer. Malformed input is an error string.
pub fn parse_tag(input: &str) -> std::result::Result<Parsed, String> {
    let start = match input.find(|c: char| !c.is_whitespace()) {
        Some(i) => i,
        None => return Ok(Parsed::Incomplete),
    };
    let body = &input[start..];
    if !body.starts_with('<') {
        return Err(format!("expected '<', found {:?}", first_chars(body)));
    }
    // Attribute values never contain a raw '>', it is always escaped.
    let close = match body.find('>') {
        Some(i) => i,
        None => return Ok(Parsed::Incomplete),
    };
    let consumed = start + close + 1;
    let inner = &body[1..close];

    if let Some(title) = inner.strip_prefix('/') {
        let title = title.trim();
        if title.is_empty() {
            return Err("empty end tag".to_string());
        }
        return Ok(Parsed::Tag(Tag::new(title, TagKind::End), consumed));
    }

    let (inner, kind) = match inner.strip_suffix('/') {
        Some(stripped) => (stripped, TagKind::Single),
        None => (inner, TagKind::Begin),
    };

    let title_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
    let title = &inner[..title_end];
    if title.is_empty() {
        return Err("tag without title".to_string());
    }
    let mut tag = Tag::new(title, kind);

    let mut rest = inner[title_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value in <{}>", title))?;
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let value_body = after
            .strip_prefix('"')
            .ok_or_else(|| format!("unquoted attribute \"{}\" in <{}>", name, title))?;
        let quote = value_body
            .find('"')
            .ok_or_else(|| format!("unterminated attribute \"{}\" in <{}>", name, title))?;
        tag.attrs
            .push((name.to_string(), unescape(&value_body[..quote])?));
        rest = value_body[quote + 1..].trim_start();
    }

    Ok(Parsed::Tag(tag, consumed))
}

fn first_chars(s: &str) -> &str {
    let end = s.char_indices().nth(16).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

/// Reads a document of the form `<root> <child .../> </root>` and returns
/// the child tag.
pub fn read_wrapped(path: &Path, root: &str, child: &str) -> Result<Tag> {
    let text = fs::read_to_string(path)?;
    let mut rest = text.as_str();
    let mut next = |expect_title: &str, expect_kind: TagKind| -> Result<Tag> {
        match parse_tag(rest).map_err(|e| DlsError::corrupt(path, e))? {
            Parsed::Tag(tag, used) => {
                rest = &rest[used..];
                if tag.title() != expect_title || tag.kind() != expect_kind {
                    return Err(DlsError::corrupt(
                        path,
                        format!("expected <{}>, found <{}>", expect_title, tag.title()),
                    ));
                }
                Ok(tag)
            }
            Parsed::Incomplete => Err(DlsError::corrupt(path, "unexpected end of file")),
        }
    };
    next(root, TagKind::Begin)?;
    let tag = next(child, TagKind::Single)?;
    next(root, TagKind::End)?;
    Ok(tag)
}

/// Renders `<root>\n <child/>\n</root>\n`.
pub fn render_wrapped(root: &str, child: &Tag) -> String {
    format!(
        "{}\n {}\n{}\n",
        Tag::new(root, TagKind::Begin),
        child,
        Tag::new(root, TagKind::End)
    )
}
