//! Rich text model and its canonical HTML serialization.
//!
//! Text is a sequence of runs with inline marks. Paragraphs are separated by
//! `\n` inside the text and serialize as `<p>` blocks:
//!
//! ```text
//! "Hi " + bold("there") + "\n" + "bye"
//!     ──► <p>Hi <strong>there</strong></p><p>bye</p>
//! ```
//!
//! Output is canonical: marks nest in a fixed order (`a`, `strong`, `em`,
//! `u`, `s`, `code`), adjacent runs with equal marks are merged, and an
//! empty document is the empty string. The parser is lenient: it also
//! accepts `<b>`, `<i>`, `<del>`, `<br>`, other block tags and entity
//! references, and drops unknown tags while keeping their text.

use serde::{Deserialize, Serialize};

/// A single inline mark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link(String),
}

/// Full set of marks applied to a run of text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marks {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strike: bool,
    pub code: bool,
    pub link: Option<String>,
}

impl Marks {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// Builder-style: return a copy with `mark` enabled.
    pub fn with(mut self, mark: Mark) -> Self {
        self.set(&mark, true);
        self
    }

    pub fn set(&mut self, mark: &Mark, enabled: bool) {
        match mark {
            Mark::Bold => self.bold = enabled,
            Mark::Italic => self.italic = enabled,
            Mark::Underline => self.underline = enabled,
            Mark::Strike => self.strike = enabled,
            Mark::Code => self.code = enabled,
            Mark::Link(href) => {
                self.link = if enabled { Some(href.clone()) } else { None };
            }
        }
    }

    /// Whether `mark` is active; links match on href.
    pub fn has(&self, mark: &Mark) -> bool {
        match mark {
            Mark::Bold => self.bold,
            Mark::Italic => self.italic,
            Mark::Underline => self.underline,
            Mark::Strike => self.strike,
            Mark::Code => self.code,
            Mark::Link(href) => self.link.as_deref() == Some(href.as_str()),
        }
    }
}

/// A run of characters sharing the same marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    pub marks: Marks,
}

/// Document content as a list of merged runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichText {
    spans: Vec<Span>,
}

impl RichText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain(text: impl Into<String>) -> Self {
        let mut rich = Self::new();
        rich.push(text, Marks::plain());
        rich
    }

    /// Append a run, merging it into the previous one when marks match.
    pub fn push(&mut self, text: impl Into<String>, marks: Marks) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        match self.spans.last_mut() {
            Some(last) if last.marks == marks => last.text.push_str(&text),
            _ => self.spans.push(Span { text, marks }),
        }
    }

    pub fn push_char(&mut self, c: char, marks: &Marks) {
        match self.spans.last_mut() {
            Some(last) if last.marks == *marks => last.text.push(c),
            _ => self.spans.push(Span {
                text: c.to_string(),
                marks: marks.clone(),
            }),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Length in chars.
    pub fn char_len(&self) -> usize {
        self.spans.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn chars(&self) -> impl Iterator<Item = (char, &Marks)> + '_ {
        self.spans
            .iter()
            .flat_map(|s| s.text.chars().map(move |c| (c, &s.marks)))
    }

    /// Sub-range `[from, to)` in chars, clamped to the content.
    pub fn slice(&self, from: usize, to: usize) -> RichText {
        let mut out = RichText::new();
        for (c, marks) in self.chars().skip(from).take(to.saturating_sub(from)) {
            out.push_char(c, marks);
        }
        out
    }

    /// Marks of the char at `index`, if any.
    pub fn marks_at(&self, index: usize) -> Option<&Marks> {
        self.chars().nth(index).map(|(_, m)| m)
    }

    // ─── HTML ─────────────────────────────────────────────────────────

    /// Serialize to the canonical HTML subset.
    pub fn to_html(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("<p>");
        for span in &self.spans {
            for (i, line) in span.text.split('\n').enumerate() {
                if i > 0 {
                    out.push_str("</p><p>");
                }
                write_run(&mut out, line, &span.marks);
            }
        }
        out.push_str("</p>");
        out
    }

    /// Parse HTML leniently into rich text.
    pub fn from_html(html: &str) -> RichText {
        HtmlReader::default().read(html)
    }
}

fn write_run(out: &mut String, text: &str, marks: &Marks) {
    if text.is_empty() {
        return;
    }
    if let Some(href) = &marks.link {
        out.push_str("<a href=\"");
        escape_into(out, href);
        out.push_str("\">");
    }
    let inline = [
        (marks.bold, "strong"),
        (marks.italic, "em"),
        (marks.underline, "u"),
        (marks.strike, "s"),
        (marks.code, "code"),
    ];
    for (_, tag) in inline.iter().filter(|(on, _)| *on) {
        out.push('<');
        out.push_str(tag);
        out.push('>');
    }
    escape_into(out, text);
    for (_, tag) in inline.iter().rev().filter(|(on, _)| *on) {
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
    if marks.link.is_some() {
        out.push_str("</a>");
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &after[..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "pre",
];

fn inline_mark(tag: &str, attrs: &str) -> Option<Mark> {
    match tag {
        "strong" | "b" => Some(Mark::Bold),
        "em" | "i" => Some(Mark::Italic),
        "u" => Some(Mark::Underline),
        "s" | "strike" | "del" => Some(Mark::Strike),
        "code" => Some(Mark::Code),
        "a" => Some(Mark::Link(attribute(attrs, "href").unwrap_or_default())),
        _ => None,
    }
}

/// Value of `name="..."` or `name='...'` inside a tag's attribute text.
fn attribute(attrs: &str, name: &str) -> Option<String> {
    let mut rest = attrs;
    while let Some(pos) = rest.find(name) {
        let after = rest[pos + name.len()..].trim_start();
        if let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let quote = value.chars().next()?;
            if quote == '"' || quote == '\'' {
                let body = &value[1..];
                let end = body.find(quote)?;
                return Some(unescape(&body[..end]));
            }
        }
        rest = &rest[pos + name.len()..];
    }
    None
}

#[derive(Default)]
struct HtmlReader {
    out: RichText,
    /// Open inline tags, innermost last
    stack: Vec<(String, Mark)>,
    blocks: usize,
    in_block: bool,
}

impl HtmlReader {
    fn read(mut self, html: &str) -> RichText {
        let mut rest = html;
        while !rest.is_empty() {
            if let Some(comment) = rest.strip_prefix("<!--") {
                rest = comment.find("-->").map_or("", |end| &comment[end + 3..]);
                continue;
            }
            match rest.find('<') {
                Some(0) => match rest.find('>') {
                    Some(end) => {
                        self.tag(&rest[1..end]);
                        rest = &rest[end + 1..];
                    }
                    None => {
                        self.text(rest);
                        rest = "";
                    }
                },
                Some(start) => {
                    self.text(&rest[..start]);
                    rest = &rest[start..];
                }
                None => {
                    self.text(rest);
                    rest = "";
                }
            }
        }
        self.out
    }

    fn marks(&self) -> Marks {
        let mut marks = Marks::plain();
        for (_, mark) in &self.stack {
            marks.set(mark, true);
        }
        marks
    }

    fn start_block(&mut self) {
        if self.blocks > 0 {
            self.out.push("\n", Marks::plain());
        }
        self.blocks += 1;
        self.in_block = true;
    }

    fn text(&mut self, raw: &str) {
        if !self.in_block {
            if raw.trim().is_empty() {
                return;
            }
            self.start_block();
        }
        let text = unescape(&raw.replace('\r', ""));
        let marks = self.marks();
        self.out.push(text, marks);
    }

    fn tag(&mut self, body: &str) {
        let body = body.trim();
        let (closing, body) = match body.strip_prefix('/') {
            Some(b) => (true, b.trim_start()),
            None => (false, body),
        };
        let body = body.strip_suffix('/').unwrap_or(body);
        let name_end = body
            .find(|c: char| c.is_whitespace())
            .unwrap_or(body.len());
        let name = body[..name_end].to_ascii_lowercase();
        let attrs = &body[name_end..];

        if name == "br" {
            if !self.in_block {
                self.start_block();
            }
            self.out.push("\n", Marks::plain());
        } else if BLOCK_TAGS.contains(&name.as_str()) {
            if closing {
                self.in_block = false;
            } else {
                self.start_block();
            }
        } else if closing {
            if let Some(pos) = self.stack.iter().rposition(|(open, _)| *open == name) {
                self.stack.remove(pos);
            }
        } else if let Some(mark) = inline_mark(&name, attrs) {
            self.stack.push((name, mark));
        }
    }
}
