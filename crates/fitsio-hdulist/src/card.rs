//! A single header record: one 80-column card, or a string value continued
//! over `CONTINUE` cards.

use std::borrow::Cow;
use std::fmt;

use log::{trace, warn};

use crate::block::CARD_SIZE;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::{
    check_text, comment_after_string, escape_string, format_float, format_value,
    parse_quoted, parse_real, parse_value_field, Value,
};

/// Keywords whose columns 9-80 are free text.
pub const COMMENTARY_KEYWORDS: [&str; 3] = ["COMMENT", "HISTORY", ""];

/// Maximum free text carried by one commentary card.
pub const COMMENTARY_WIDTH: usize = CARD_SIZE - 8;

const CONTINUE: &str = "CONTINUE";

/// Escaped string characters that fit between the quotes of one card.
const MAX_QUOTED: usize = CARD_SIZE - 12;

/// Escaped characters per CONTINUE segment, leaving room for the `&`.
const SEGMENT_TEXT: usize = MAX_QUOTED - 1;

/// Comment characters per `CONTINUE  '' / ...` card.
const COMMENT_SEGMENT: usize = CARD_SIZE - 16;

/// What a card says, independent of how it was laid out.
#[derive(Debug, Clone, PartialEq)]
pub enum CardBody {
    /// `KEYWORD = value / comment`, possibly continued.
    Value {
        value: Value,
        comment: Option<String>,
    },
    /// Record-valued card `KEYWORD = 'field: number'`, addressed as
    /// `KEYWORD.field`. The value is always a [`Value::Float`].
    Record {
        field: String,
        value: Value,
        comment: Option<String>,
    },
    /// COMMENT, HISTORY, blank keyword, or any card without a value indicator.
    Commentary(String),
    End,
    /// A record that failed to parse; its image is kept verbatim.
    Invalid { reason: String },
}

/// One keyword record. Parsed cards remember their exact image so that an
/// untouched header serializes byte for byte as it was read.
#[derive(Debug, Clone)]
pub struct Card {
    keyword: String,
    body: CardBody,
    image: Option<String>,
}

impl PartialEq for Card {
    fn eq(&self, other: &Self) -> bool {
        self.keyword == other.keyword
            && self.body == other.body
            && (!self.is_invalid() || self.image == other.image)
    }
}

impl Card {
    // ── Construction ──

    /// A `KEYWORD = value` card.
    pub fn new(keyword: &str, value: impl Into<Value>) -> Result<Card> {
        let keyword = normalize_keyword(keyword)?;
        if is_commentary_keyword(&keyword) || keyword == "END" || keyword == CONTINUE {
            return Err(Error::InvalidKeyword(keyword));
        }
        let value = value.into();
        value
            .check_writable()
            .map_err(|reason| Error::invalid_value(&keyword, reason))?;
        Ok(Card {
            keyword,
            body: CardBody::Value {
                value,
                comment: None,
            },
            image: None,
        })
    }

    /// A `KEYWORD = value / comment` card.
    pub fn with_comment(keyword: &str, value: impl Into<Value>, comment: &str) -> Result<Card> {
        let mut card = Card::new(keyword, value)?;
        card.set_comment(Some(comment))?;
        Ok(card)
    }

    /// A COMMENT, HISTORY or blank-keyword card.
    pub fn commentary(keyword: &str, text: &str) -> Result<Card> {
        let keyword = normalize_keyword(keyword)?;
        if !is_commentary_keyword(&keyword) {
            return Err(Error::InvalidKeyword(keyword));
        }
        let text = checked_commentary(&keyword, text)?;
        Ok(Card {
            keyword,
            body: CardBody::Commentary(text),
            image: None,
        })
    }

    /// A record-valued card such as `DP1 = 'AXIS.1: 1.0'`.
    pub fn record(keyword: &str, field: &str, value: f64) -> Result<Card> {
        let keyword = normalize_keyword(keyword)?;
        if is_commentary_keyword(&keyword) || !is_field_specifier(field) {
            return Err(Error::InvalidKeyword(format!("{keyword}.{field}")));
        }
        let value = Value::Float(value);
        value
            .check_writable()
            .map_err(|reason| Error::invalid_value(&keyword, reason))?;
        let card = Card {
            keyword,
            body: CardBody::Record {
                field: field.to_string(),
                value,
                comment: None,
            },
            image: None,
        };
        card.check_record_fits()?;
        Ok(card)
    }

    pub fn end() -> Card {
        Card {
            keyword: String::from("END"),
            body: CardBody::End,
            image: None,
        }
    }

    /// Keep an unparseable image verbatim.
    pub(crate) fn invalid(image: &str, reason: String) -> Card {
        let keyword = image.get(..8).unwrap_or(image).trim_end().to_string();
        Card {
            keyword,
            body: CardBody::Invalid { reason },
            image: Some(image.to_string()),
        }
    }

    // ── Accessors ──

    /// The base keyword, upper-case and without padding.
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// The field specifier of a record-valued card.
    pub fn field(&self) -> Option<&str> {
        match &self.body {
            CardBody::Record { field, .. } => Some(field),
            _ => None,
        }
    }

    /// The name under which this card is looked up: `KEYWORD` or, for
    /// record-valued cards, `KEYWORD.FIELD`.
    pub fn lookup_key(&self) -> String {
        match &self.body {
            CardBody::Record { field, .. } => {
                format!("{}.{}", self.keyword, field.to_ascii_uppercase())
            }
            _ => self.keyword.clone(),
        }
    }

    pub fn body(&self) -> &CardBody {
        &self.body
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.body {
            CardBody::Value { value, .. } | CardBody::Record { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The comment of a valued card, or the text of a commentary card.
    pub fn comment(&self) -> Option<&str> {
        match &self.body {
            CardBody::Value { comment, .. } | CardBody::Record { comment, .. } => {
                comment.as_deref()
            }
            CardBody::Commentary(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_commentary(&self) -> bool {
        matches!(self.body, CardBody::Commentary(_))
    }

    pub fn is_blank(&self) -> bool {
        self.keyword.is_empty() && self.comment().is_none_or(|t| t.trim().is_empty())
    }

    pub fn is_end(&self) -> bool {
        matches!(self.body, CardBody::End)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.body, CardBody::Invalid { .. })
    }

    /// Case-insensitive keyword comparison; dotted names match record cards.
    pub fn matches(&self, keyword: &str) -> bool {
        let keyword = keyword.trim();
        match (&self.body, keyword.split_once('.')) {
            (CardBody::Record { field, .. }, Some((base, f))) => {
                self.keyword.eq_ignore_ascii_case(base) && field.eq_ignore_ascii_case(f)
            }
            _ => self.keyword.eq_ignore_ascii_case(keyword),
        }
    }

    /// Number of 80-byte cards in the rendered image.
    pub fn card_count(&self) -> usize {
        self.image().len() / CARD_SIZE
    }

    // ── Mutation ──

    pub fn set_value(&mut self, new: impl Into<Value>) -> Result<()> {
        let new = new.into();
        match &mut self.body {
            CardBody::Value { value, .. } => {
                new.check_writable()
                    .map_err(|reason| Error::invalid_value(&self.keyword, reason))?;
                if *value != new {
                    *value = new;
                    self.image = None;
                }
            }
            CardBody::Record { value, .. } => {
                let f = new.as_f64().ok_or_else(|| {
                    Error::invalid_value(&self.keyword, "record-valued cards hold numbers")
                })?;
                let new = Value::Float(f);
                new.check_writable()
                    .map_err(|reason| Error::invalid_value(&self.keyword, reason))?;
                if *value != new {
                    *value = new;
                    self.image = None;
                }
            }
            CardBody::Commentary(text) => {
                let Value::String(s) = new else {
                    return Err(Error::invalid_value(
                        &self.keyword,
                        "commentary cards hold text",
                    ));
                };
                let s = checked_commentary(&self.keyword, &s)?;
                if *text != s {
                    *text = s;
                    self.image = None;
                }
            }
            CardBody::End | CardBody::Invalid { .. } => {
                return Err(Error::invalid_value(&self.keyword, "card carries no value"));
            }
        }
        self.check_record_fits()?;
        self.fit_comment();
        Ok(())
    }

    pub fn set_comment(&mut self, new: Option<&str>) -> Result<()> {
        let new = match new.map(str::trim_end) {
            Some("") | None => None,
            Some(c) => {
                check_text(c).map_err(|reason| Error::invalid_value(&self.keyword, reason))?;
                Some(c.to_string())
            }
        };
        match &mut self.body {
            CardBody::Value { comment, .. } | CardBody::Record { comment, .. } => {
                if *comment != new {
                    *comment = new;
                    self.image = None;
                    self.fit_comment();
                }
                Ok(())
            }
            _ => Err(Error::invalid_value(&self.keyword, "card takes no comment")),
        }
    }

    /// Rename the keyword, keeping value and comment.
    pub(crate) fn set_keyword(&mut self, keyword: String) {
        if self.keyword != keyword {
            self.keyword = keyword;
            self.image = None;
            self.fit_comment();
        }
    }

    fn check_record_fits(&self) -> Result<()> {
        if let CardBody::Record { field, value, .. } = &self.body {
            if record_text(field, value).len() > MAX_QUOTED {
                return Err(Error::invalid_value(
                    self.lookup_key(),
                    "record-valued card does not fit in one card",
                ));
            }
        }
        Ok(())
    }

    /// Comments that do not fit beside a one-card value are cut to the
    /// remaining columns, so the stored card matches what a reader sees.
    fn fit_comment(&mut self) {
        if let CardBody::Value {
            value: Value::String(s),
            ..
        } = &self.body
        {
            if is_long_string(s) {
                return;
            }
        }
        let room = CARD_SIZE.saturating_sub(self.value_line().len() + 3);
        if let CardBody::Value { comment, .. } | CardBody::Record { comment, .. } = &mut self.body {
            if let Some(c) = comment.as_deref().filter(|c| c.len() > room) {
                warn!(
                    "comment of {} is {} characters, truncated to {room}",
                    self.keyword,
                    c.len()
                );
                let kept = c[..room].trim_end().to_string();
                *comment = (!kept.is_empty()).then_some(kept);
            }
        }
    }

    /// A value or record card laid out on one card, without its comment.
    fn value_line(&self) -> String {
        let head = format!("{:<8}= ", self.keyword);
        match &self.body {
            CardBody::Value {
                value: Value::Undefined,
                comment: Some(_),
            } => format!("{head}{:20}", ""),
            CardBody::Value { value, .. } => format!("{head}{}", format_value(value)),
            CardBody::Record { field, value, .. } => {
                let text = Value::String(record_text(field, value));
                format!("{head}{}", format_value(&text))
            }
            _ => head,
        }
    }

    // ── Rendering ──

    /// The card image: the cached original when untouched, otherwise a fresh
    /// rendering. Always a whole number of 80-byte cards.
    pub fn image(&self) -> Cow<'_, str> {
        match &self.image {
            Some(image) => Cow::Borrowed(image),
            None => Cow::Owned(self.render()),
        }
    }

    /// Render from keyword, value and comment, ignoring any cached image.
    pub fn render(&self) -> String {
        match &self.body {
            CardBody::Value {
                value: Value::String(s),
                comment,
            } if is_long_string(s) => {
                render_long_string(&format!("{:<8}= ", self.keyword), s, comment.as_deref())
            }
            CardBody::Value { comment, .. } | CardBody::Record { comment, .. } => {
                append_comment(self.value_line(), comment)
            }
            CardBody::Commentary(text) => pad_card(format!("{:<8}{text}", self.keyword)),
            CardBody::End => pad_card(String::from("END")),
            CardBody::Invalid { .. } => self.image.clone().unwrap_or_default(),
        }
    }

    // ── Parsing ──

    /// Parse one card image, or a string card followed by its CONTINUE cards.
    pub fn parse(bytes: &[u8], config: &Config) -> Result<Card> {
        Card::parse_at(bytes, 0, config)
    }

    /// Like [`Card::parse`], reporting errors at absolute byte `offset`.
    pub(crate) fn parse_at(bytes: &[u8], offset: u64, config: &Config) -> Result<Card> {
        let malformed = |keyword: &str, reason: String| Error::MalformedCard {
            offset,
            keyword: keyword.to_string(),
            reason,
        };
        if bytes.is_empty() || bytes.len() % CARD_SIZE != 0 {
            return Err(malformed("", format!("{} bytes is not a whole card", bytes.len())));
        }
        if let Some(pos) = bytes.iter().position(|b| !(0x20..=0x7e).contains(b)) {
            let keyword = String::from_utf8_lossy(&bytes[..8]).trim_end().to_string();
            let column = pos % CARD_SIZE + 1;
            return Err(malformed(&keyword, format!("non-printable byte at column {column}")));
        }
        // Printable ASCII throughout, so this cannot fail.
        let text = std::str::from_utf8(bytes)
            .map_err(|e| malformed("", e.to_string()))?;
        let first = &text[..CARD_SIZE];
        let keyword = parse_keyword(&first[..8])
            .map_err(|reason| malformed(first[..8].trim_end(), reason))?;
        let chained = text.len() > CARD_SIZE;

        let body = if keyword == "END" {
            CardBody::End
        } else if keyword == CONTINUE {
            return Err(malformed(
                &keyword,
                String::from("CONTINUE without a preceding string ending in '&'"),
            ));
        } else if is_commentary_keyword(&keyword) || &first[8..10] != "= " {
            CardBody::Commentary(first[8..].trim_end().to_string())
        } else if chained {
            parse_chain(text, config.strip_header_whitespace)
                .map_err(|reason| malformed(&keyword, reason))?
        } else {
            let (value, comment) = parse_value_field(&first[10..], config.strip_header_whitespace)
                .map_err(|reason| malformed(&keyword, reason))?;
            match value {
                Value::String(s) if config.enable_record_valued_keyword_cards => {
                    match parse_record(&s) {
                        Some((field, number)) => CardBody::Record {
                            field,
                            value: Value::Float(number),
                            comment,
                        },
                        None => CardBody::Value {
                            value: Value::String(s),
                            comment,
                        },
                    }
                }
                value => CardBody::Value { value, comment },
            }
        };
        if chained && !matches!(body, CardBody::Value { .. }) {
            return Err(malformed(
                &keyword,
                String::from("only string values may be continued"),
            ));
        }
        trace!("parsed card {keyword:?} at byte {offset}");
        Ok(Card {
            keyword,
            body,
            image: Some(text.to_string()),
        })
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let image = self.image();
        for (i, chunk) in image.as_bytes().chunks(CARD_SIZE).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", String::from_utf8_lossy(chunk))?;
        }
        Ok(())
    }
}

// ── Keywords ──

pub fn is_commentary_keyword(keyword: &str) -> bool {
    COMMENTARY_KEYWORDS.contains(&keyword)
}

/// Upper-case and validate a user-supplied keyword.
pub fn normalize_keyword(keyword: &str) -> Result<String> {
    let upper = keyword.trim().to_ascii_uppercase();
    if upper.len() > 8 || !upper.bytes().all(is_keyword_byte) {
        return Err(Error::InvalidKeyword(keyword.to_string()));
    }
    Ok(upper)
}

fn is_keyword_byte(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_')
}

/// Validate columns 1-8: keyword characters, then only trailing blanks.
fn parse_keyword(field: &str) -> std::result::Result<String, String> {
    let name = field.trim_end();
    match name.bytes().position(|b| !is_keyword_byte(b)) {
        Some(pos) => Err(format!(
            "invalid keyword character {:?} at column {}",
            name.as_bytes()[pos] as char,
            pos + 1
        )),
        None => Ok(name.to_string()),
    }
}

/// Does this raw card hold a string value that continues on the next card?
pub(crate) fn continues(card: &str) -> bool {
    let Some(field) = value_field(card) else {
        return false;
    };
    let Some(body) = field.trim_start().strip_prefix('\'') else {
        return false;
    };
    matches!(parse_quoted(body), Ok((s, _)) if s.trim_end().ends_with('&'))
}

pub(crate) fn is_continue_card(card: &str) -> bool {
    card.starts_with(CONTINUE)
}

/// Columns 11-80 of a valued card or columns 9-80 of a CONTINUE card.
fn value_field(card: &str) -> Option<&str> {
    let keyword = card.get(..8)?.trim_end();
    if keyword == CONTINUE {
        card.get(8..)
    } else if !is_commentary_keyword(keyword) && card.get(8..10) == Some("= ") {
        card.get(10..)
    } else {
        None
    }
}

// ── Long strings ──

fn parse_chain(text: &str, strip: bool) -> std::result::Result<CardBody, String> {
    let mut value = String::new();
    let mut comment = String::new();
    let segments = text.len() / CARD_SIZE;
    for i in 0..segments {
        let card = &text[i * CARD_SIZE..(i + 1) * CARD_SIZE];
        let field = value_field(card).ok_or_else(|| String::from("broken CONTINUE chain"))?;
        let body = field
            .trim_start()
            .strip_prefix('\'')
            .ok_or_else(|| String::from("CONTINUE card without a string"))?;
        let (segment, after) = parse_quoted(body)?;
        let trimmed = segment.trim_end();
        match trimmed.strip_suffix('&') {
            Some(head) => value.push_str(head),
            None if i + 1 < segments => {
                return Err(String::from("continued segment does not end in '&'"))
            }
            None => value.push_str(&segment),
        }
        if let Some(c) = comment_after_string(after)? {
            comment.push_str(&c);
        }
    }
    if strip {
        value.truncate(value.trim_end().len());
    }
    Ok(CardBody::Value {
        value: Value::String(value),
        comment: if comment.is_empty() { None } else { Some(comment) },
    })
}

fn render_long_string(head: &str, s: &str, comment: Option<&str>) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in s.chars() {
        let unit = if ch == '\'' { 2 } else { 1 };
        if current.len() + unit > SEGMENT_TEXT {
            segments.push(std::mem::take(&mut current));
        }
        if ch == '\'' {
            current.push_str("''");
        } else {
            current.push(ch);
        }
    }
    segments.push(current);

    let mut out = String::new();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        let lead = if i == 0 { head } else { "CONTINUE  " };
        if i < last {
            out.push_str(&pad_card(format!("{lead}'{segment}&'")));
            continue;
        }
        let inline = match comment {
            Some(c) => format!("{lead}'{segment}' / {c}"),
            None => format!("{lead}'{segment}'"),
        };
        if inline.len() <= CARD_SIZE && !segment.ends_with('&') {
            out.push_str(&pad_card(inline));
            break;
        }
        out.push_str(&pad_card(format!("{lead}'{segment}&'")));
        match comment {
            Some(c) => {
                let chunks = comment_chunks(c);
                let n = chunks.len();
                for (j, chunk) in chunks.into_iter().enumerate() {
                    let marker = if j + 1 < n { "&" } else { "" };
                    out.push_str(&pad_card(format!("CONTINUE  '{marker}' / {chunk}")));
                }
            }
            None => out.push_str(&pad_card(String::from("CONTINUE  ''"))),
        }
    }
    out
}

/// Split a comment so no chunk ends in a blank, since trailing blanks do
/// not survive a parse.
fn comment_chunks(comment: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = comment;
    while !rest.is_empty() {
        let mut end = rest.len().min(COMMENT_SEGMENT);
        while end > 1 && end < rest.len() && rest.as_bytes()[end - 1] == b' ' {
            end -= 1;
        }
        chunks.push(&rest[..end]);
        rest = &rest[end..];
    }
    chunks
}

// ── Record-valued cards ──

/// `field: number` where field is dotted identifiers, e.g. `AXIS.1: 2`.
fn parse_record(s: &str) -> Option<(String, f64)> {
    let (field, number) = s.split_once(':')?;
    let field = field.trim();
    if !is_field_specifier(field) {
        return None;
    }
    Some((field.to_string(), parse_real(number)?))
}

fn is_field_specifier(field: &str) -> bool {
    let mut parts = field.split('.');
    let first_ok = parts
        .next()
        .and_then(|p| p.bytes().next())
        .is_some_and(|b| b.is_ascii_alphabetic() || b == b'_');
    first_ok
        && field
            .split('.')
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

fn record_text(field: &str, value: &Value) -> String {
    let number = value.as_f64().map(format_float).unwrap_or_default();
    format!("{field}: {number}")
}

// ── Helpers ──

fn checked_commentary(keyword: &str, text: &str) -> Result<String> {
    let text = text.trim_end();
    check_text(text).map_err(|reason| Error::invalid_value(keyword, reason))?;
    if text.len() > COMMENTARY_WIDTH {
        return Err(Error::invalid_value(
            keyword,
            format!("commentary text longer than {COMMENTARY_WIDTH} columns"),
        ));
    }
    Ok(text.to_string())
}

fn is_long_string(s: &str) -> bool {
    escape_string(s).len() > MAX_QUOTED
}

fn append_comment(line: String, comment: &Option<String>) -> String {
    match comment {
        Some(c) => pad_card(format!("{line} / {c}")),
        None => pad_card(line),
    }
}

/// Truncate or blank-pad to exactly one card.
fn pad_card(mut line: String) -> String {
    line.truncate(CARD_SIZE);
    format!("{line:<80}")
}
