//! Ordered card collection with keyword lookup, editing, and block
//! serialization.

use std::collections::HashMap;
use std::fmt;

use log::{trace, warn};

use crate::block::{pad_to_block, padded_byte_len, BLOCK_SIZE, CARD_SIZE, HEADER_PAD_BYTE};
use crate::card::{
    continues, is_commentary_keyword, is_continue_card, normalize_keyword, Card, COMMENTARY_WIDTH,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::Value;

const END_KEYWORD: &[u8; 8] = b"END     ";

// ── Placement ──

/// A reference point inside a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<'a> {
    /// First occurrence of a keyword.
    Keyword(&'a str),
    /// Card position.
    Index(usize),
}

impl<'a> From<&'a str> for Anchor<'a> {
    fn from(keyword: &'a str) -> Self {
        Anchor::Keyword(keyword)
    }
}

impl From<usize> for Anchor<'_> {
    fn from(index: usize) -> Self {
        Anchor::Index(index)
    }
}

/// Where [`Header::set_at`] puts a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement<'a> {
    Before(Anchor<'a>),
    After(Anchor<'a>),
}

// ── Header ──

/// The cards of one HDU header, END excluded.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<Card>,
    index: HashMap<String, Vec<usize>>,
    /// Non-blank text found after END in the final block.
    trailing: Option<String>,
    modified: bool,
    layout_revision: u64,
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.cards == other.cards
    }
}

impl Header {
    pub fn new() -> Self {
        Header::default()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards.iter()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Whether any card changed since the header was parsed or last flushed.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_clean(&mut self) {
        self.modified = false;
    }

    /// Bumped whenever a keyword that shapes the data layout changes.
    pub(crate) fn layout_revision(&self) -> u64 {
        self.layout_revision
    }

    // ── Lookup ──

    pub fn position(&self, keyword: &str) -> Option<usize> {
        self.position_nth(keyword, 0)
    }

    pub fn position_nth(&self, keyword: &str, nth: usize) -> Option<usize> {
        self.index.get(&lookup_key(keyword))?.get(nth).copied()
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.position(keyword).is_some()
    }

    /// Number of cards carrying `keyword`.
    pub fn count(&self, keyword: &str) -> usize {
        self.index.get(&lookup_key(keyword)).map_or(0, Vec::len)
    }

    pub fn card(&self, keyword: &str) -> Option<&Card> {
        self.card_nth(keyword, 0)
    }

    pub fn card_nth(&self, keyword: &str, nth: usize) -> Option<&Card> {
        self.position_nth(keyword, nth).map(|i| &self.cards[i])
    }

    pub fn get(&self, keyword: &str) -> Result<&Value> {
        self.get_nth(keyword, 0)
    }

    /// Value of the `nth` occurrence of `keyword`.
    pub fn get_nth(&self, keyword: &str, nth: usize) -> Result<&Value> {
        let card = self.card_nth(keyword, nth).ok_or_else(|| Error::KeyNotFound {
            keyword: lookup_key(keyword),
            nth,
        })?;
        card.value()
            .ok_or_else(|| Error::invalid_value(card.keyword(), "card has no value field"))
    }

    /// Value of `keyword` if present, `None` when absent or valueless.
    pub fn find(&self, keyword: &str) -> Option<&Value> {
        self.card(keyword).and_then(Card::value)
    }

    pub fn get_i64(&self, keyword: &str) -> Result<i64> {
        let value = self.get(keyword)?;
        value.as_i64().ok_or_else(|| type_mismatch(keyword, "integer", value))
    }

    /// Integer or float values as `f64`.
    pub fn get_f64(&self, keyword: &str) -> Result<f64> {
        let value = self.get(keyword)?;
        value.as_f64().ok_or_else(|| type_mismatch(keyword, "number", value))
    }

    pub fn get_str(&self, keyword: &str) -> Result<&str> {
        let value = self.get(keyword)?;
        value.as_str().ok_or_else(|| type_mismatch(keyword, "string", value))
    }

    pub fn get_bool(&self, keyword: &str) -> Result<bool> {
        let value = self.get(keyword)?;
        value.as_bool().ok_or_else(|| type_mismatch(keyword, "logical", value))
    }

    // ── Editing ──

    /// Insert or update a keyword.
    ///
    /// An existing card keeps its position; `None` keeps its comment.
    /// Commentary keywords always append a new card, and dotted names such
    /// as `DP1.AXIS.1` set record-valued cards.
    pub fn set(
        &mut self,
        keyword: &str,
        value: impl Into<Value>,
        comment: Option<&str>,
    ) -> Result<()> {
        let value = value.into();
        let keyword = keyword.trim();
        if let Some((base, field)) = keyword.split_once('.') {
            return self.set_record(base, field, value, comment);
        }
        let keyword = normalize_keyword(keyword)?;
        if is_commentary_keyword(&keyword) {
            let Value::String(text) = value else {
                return Err(Error::invalid_value(keyword, "commentary cards hold text"));
            };
            return self.add_commentary(&keyword, &text);
        }
        match self.position(&keyword) {
            Some(i) => self.update(i, value, comment),
            None => {
                let mut card = Card::new(&keyword, value)?;
                card.set_comment(comment)?;
                self.append(card)
            }
        }
    }

    fn set_record(
        &mut self,
        base: &str,
        field: &str,
        value: Value,
        comment: Option<&str>,
    ) -> Result<()> {
        let number = value.as_f64().ok_or_else(|| {
            Error::invalid_value(format!("{base}.{field}"), "record-valued cards hold numbers")
        })?;
        match self.position(&format!("{base}.{field}")) {
            Some(i) => self.update(i, Value::Float(number), comment),
            None => {
                let mut card = Card::record(base, field, number)?;
                card.set_comment(comment)?;
                self.append(card)
            }
        }
    }

    fn update(&mut self, i: usize, value: Value, comment: Option<&str>) -> Result<()> {
        let mut card = self.cards[i].clone();
        card.set_value(value)?;
        if comment.is_some() {
            card.set_comment(comment)?;
        }
        if card != self.cards[i] {
            self.touch(card.keyword());
            self.cards[i] = card;
        }
        Ok(())
    }

    /// Set a keyword and move it to an explicit position.
    pub fn set_at(
        &mut self,
        keyword: &str,
        value: impl Into<Value>,
        comment: Option<&str>,
        placement: Placement<'_>,
    ) -> Result<()> {
        let target = match placement {
            Placement::Before(anchor) => self.resolve(anchor)?,
            Placement::After(anchor) => self.resolve(anchor)? + 1,
        };
        let key = lookup_key(keyword);
        if is_commentary_keyword(&key) {
            let Value::String(text) = value.into() else {
                return Err(Error::invalid_value(key, "commentary cards hold text"));
            };
            return self.insert(target, Card::commentary(&key, &text)?);
        }
        self.set(keyword, value, comment)?;
        let Some(current) = self.position(keyword) else {
            return Ok(());
        };
        if current == target || current + 1 == target {
            return Ok(());
        }
        let card = self.cards.remove(current);
        let target = if current < target { target - 1 } else { target };
        self.cards.insert(target, card);
        self.modified = true;
        self.reindex();
        Ok(())
    }

    fn resolve(&self, anchor: Anchor<'_>) -> Result<usize> {
        match anchor {
            Anchor::Keyword(keyword) => self.position(keyword).ok_or_else(|| Error::KeyNotFound {
                keyword: lookup_key(keyword),
                nth: 0,
            }),
            Anchor::Index(i) if i < self.cards.len() => Ok(i),
            Anchor::Index(i) => Err(Error::OutOfRange {
                index: i,
                len: self.cards.len(),
            }),
        }
    }

    /// Remove the first occurrence. Returns whether a card was removed.
    pub fn delete(&mut self, keyword: &str) -> bool {
        self.delete_nth(keyword, 0)
    }

    pub fn delete_nth(&mut self, keyword: &str, nth: usize) -> bool {
        match self.position_nth(keyword, nth) {
            Some(i) => {
                let card = self.cards.remove(i);
                self.touch(card.keyword());
                self.reindex();
                true
            }
            None => false,
        }
    }

    /// Remove the card at `index`.
    pub fn remove(&mut self, index: usize) -> Result<Card> {
        if index >= self.cards.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.cards.len(),
            });
        }
        let card = self.cards.remove(index);
        self.touch(card.keyword());
        self.reindex();
        Ok(card)
    }

    /// Insert a card at `index` (at most `len()`).
    pub fn insert(&mut self, index: usize, card: Card) -> Result<()> {
        if card.is_end() {
            return Err(Error::InvalidKeyword(String::from("END")));
        }
        if index > self.cards.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.cards.len(),
            });
        }
        self.touch(card.keyword());
        self.cards.insert(index, card);
        self.reindex();
        Ok(())
    }

    /// Append a card, filling the first of any trailing blank cards.
    pub fn append(&mut self, card: Card) -> Result<()> {
        if card.is_end() {
            return Err(Error::InvalidKeyword(String::from("END")));
        }
        self.touch(card.keyword());
        let last_used = self.cards.iter().rposition(|c| !c.is_blank());
        let first_blank = last_used.map_or(0, |i| i + 1);
        if !card.is_blank() && first_blank < self.cards.len() {
            self.cards[first_blank] = card;
        } else {
            self.cards.push(card);
        }
        self.reindex();
        Ok(())
    }

    /// Change a keyword name in place.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let new = normalize_keyword(new)?;
        let old_key = lookup_key(old);
        if is_commentary_keyword(&new) || is_commentary_keyword(&old_key) {
            return Err(Error::InvalidKeyword(new));
        }
        let i = self.position(old).ok_or_else(|| Error::KeyNotFound {
            keyword: old_key.clone(),
            nth: 0,
        })?;
        if new == old_key {
            return Ok(());
        }
        if self.contains(&new) {
            return Err(Error::invalid_value(new, "keyword already present"));
        }
        self.touch(&old_key);
        self.touch(&new);
        self.cards[i].set_keyword(new);
        self.reindex();
        Ok(())
    }

    pub fn add_comment(&mut self, text: &str) -> Result<()> {
        self.add_commentary("COMMENT", text)
    }

    pub fn add_history(&mut self, text: &str) -> Result<()> {
        self.add_commentary("HISTORY", text)
    }

    pub fn add_blank(&mut self, text: &str) -> Result<()> {
        self.add_commentary("", text)
    }

    /// Append commentary text, one card per 72 columns.
    fn add_commentary(&mut self, keyword: &str, text: &str) -> Result<()> {
        let text = text.trim_end();
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return self.append(Card::commentary(keyword, "")?);
        }
        for chunk in bytes.chunks(COMMENTARY_WIDTH) {
            let chunk = std::str::from_utf8(chunk)
                .map_err(|_| Error::invalid_value(keyword, "commentary text must be ASCII"))?;
            self.append(Card::commentary(keyword, chunk)?)?;
        }
        Ok(())
    }

    fn touch(&mut self, keyword: &str) {
        self.modified = true;
        if affects_layout(keyword) {
            self.layout_revision += 1;
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, card) in self.cards.iter().enumerate() {
            if card.is_invalid() {
                continue;
            }
            self.index.entry(card.keyword().to_string()).or_default().push(i);
            if card.field().is_some() {
                self.index.entry(card.lookup_key()).or_default().push(i);
            }
        }
    }

    // ── Serialization ──

    /// Cards, END, any preserved post-END text, then blank padding to a
    /// whole number of blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(BLOCK_SIZE);
        for card in &self.cards {
            out.push_str(&card.image());
        }
        out.push_str(&Card::end().render());
        if let Some(trailing) = &self.trailing {
            out.push_str(trailing);
        }
        let mut bytes = out.into_bytes();
        pad_to_block(&mut bytes, HEADER_PAD_BYTE);
        bytes
    }

    /// Serialized size in bytes, always a multiple of 2880.
    pub fn byte_len(&self) -> usize {
        let cards: usize = self.cards.iter().map(|c| c.image().len()).sum();
        let trailing = self.trailing.as_ref().map_or(0, String::len);
        padded_byte_len(cards + CARD_SIZE + trailing)
    }

    // ── Parsing ──

    /// Parse header blocks up to and including the one holding END.
    pub fn parse(bytes: &[u8], config: &Config) -> Result<Header> {
        Header::parse_at(bytes, 0, config)
    }

    /// Like [`Header::parse`], reporting positions relative to `offset`.
    pub(crate) fn parse_at(bytes: &[u8], offset: u64, config: &Config) -> Result<Header> {
        let total = bytes.len() / CARD_SIZE;
        let card_at = |i: usize| &bytes[i * CARD_SIZE..(i + 1) * CARD_SIZE];
        let mut header = Header::new();
        let mut i = 0;
        while i < total {
            let raw = card_at(i);
            if &raw[..8] == END_KEYWORD {
                header.trailing = trailing_text(bytes, i, offset, config)?;
                header.reindex();
                trace!("parsed {} cards at byte {offset}", header.cards.len());
                return Ok(header);
            }
            let mut j = i + 1;
            while j < total
                && ascii(card_at(j - 1)).is_some_and(continues)
                && ascii(card_at(j)).is_some_and(is_continue_card)
            {
                j += 1;
            }
            let chunk = &bytes[i * CARD_SIZE..j * CARD_SIZE];
            let card_offset = offset + (i * CARD_SIZE) as u64;
            match Card::parse_at(chunk, card_offset, config) {
                Ok(card) => header.cards.push(card),
                Err(e) if config.strict => return Err(e),
                Err(e) => {
                    warn!("{e}; keeping the card verbatim");
                    for raw in chunk.chunks(CARD_SIZE) {
                        header.cards.push(Card::invalid(&sanitize(raw), e.to_string()));
                    }
                }
            }
            i = j;
        }
        Err(Error::TruncatedFile {
            offset: offset + bytes.len() as u64,
            wanted: BLOCK_SIZE as u64,
        })
    }
}

/// Byte length of the header in `bytes`, if its END card is present.
pub(crate) fn header_len(bytes: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(CARD_SIZE)
        .position(|card| &card[..8] == END_KEYWORD)
        .map(|i| padded_byte_len((i + 1) * CARD_SIZE))
}

fn trailing_text(bytes: &[u8], end: usize, offset: u64, config: &Config) -> Result<Option<String>> {
    let from = (end + 1) * CARD_SIZE;
    let to = padded_byte_len(from).min(bytes.len());
    let rest = &bytes[from..to];
    if rest.iter().all(|&b| b == HEADER_PAD_BYTE) {
        return Ok(None);
    }
    let err = Error::consistency(
        "END",
        format!("non-blank bytes after END at byte {}", offset + from as u64),
    );
    if config.strict {
        return Err(err);
    }
    warn!("{err}; preserving them");
    let text = sanitize(rest);
    Ok(Some(text.trim_end().to_string()))
}

fn ascii(raw: &[u8]) -> Option<&str> {
    std::str::from_utf8(raw).ok()
}

/// Keep the column count while replacing bytes a card cannot hold.
fn sanitize(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '?' })
        .collect()
}

fn lookup_key(keyword: &str) -> String {
    keyword.trim().to_ascii_uppercase()
}

fn type_mismatch(keyword: &str, expected: &str, found: &Value) -> Error {
    Error::TypeMismatch {
        expected: format!("{expected} value for {}", lookup_key(keyword)),
        found: found.type_name().to_string(),
    }
}

/// Keywords whose change invalidates a cached column layout or data shape.
fn affects_layout(keyword: &str) -> bool {
    const INDEXED: [&str; 10] = [
        "NAXIS", "TFORM", "TTYPE", "TDIM", "TSCAL", "TZERO", "TNULL", "TBCOL", "TUNIT", "TDISP",
    ];
    matches!(keyword, "BITPIX" | "TFIELDS" | "THEAP" | "PCOUNT" | "GCOUNT")
        || INDEXED.iter().any(|p| keyword.starts_with(p))
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for card in &self.cards {
            writeln!(f, "{card}")?;
        }
        write!(f, "{}", Card::end().render().trim_end())
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(cards: &[&str]) -> Vec<u8> {
        let mut bytes: Vec<u8> =
            cards.iter().flat_map(|c| format!("{c:<80}").into_bytes()).collect();
        pad_to_block(&mut bytes, HEADER_PAD_BYTE);
        bytes
    }

    fn sample() -> Vec<u8> {
        block(&[
            "SIMPLE  =                    T / conforms",
            "BITPIX  =                   16",
            "NAXIS   =                    2",
            "NAXIS1  =                   10",
            "NAXIS2  =                   20",
            "OBJECT  = 'M31     '           / target",
            "HISTORY first",
            "HISTORY second",
            "END",
        ])
    }

    fn parsed() -> Header {
        Header::parse(&sample(), &Config::default()).unwrap()
    }

    // ---- parsing ----

    #[test]
    fn parse_and_lookup() {
        let h = parsed();
        assert_eq!(h.len(), 8);
        assert!(h.get_bool("SIMPLE").unwrap());
        assert_eq!(h.get_i64("naxis1").unwrap(), 10);
        assert_eq!(h.get_str("OBJECT").unwrap(), "M31");
        assert_eq!(h.count("HISTORY"), 2);
        assert_eq!(h.card_nth("HISTORY", 1).and_then(Card::comment), Some("second"));
        assert!(!h.is_modified());
    }

    #[test]
    fn untouched_header_round_trips_bytes() {
        let raw = sample();
        assert_eq!(Header::parse(&raw, &Config::default()).unwrap().to_bytes(), raw);
    }

    #[test]
    fn missing_end_is_truncation() {
        let mut raw = sample();
        raw.truncate(8 * CARD_SIZE);
        raw.resize(BLOCK_SIZE, b' ');
        let err = Header::parse(&raw, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::TruncatedFile { .. }));
    }

    #[test]
    fn missing_key_and_type_errors() {
        let h = parsed();
        assert!(matches!(h.get("EXPTIME"), Err(Error::KeyNotFound { nth: 0, .. })));
        assert!(matches!(h.get_nth("HISTORY", 5), Err(Error::KeyNotFound { nth: 5, .. })));
        assert!(matches!(h.get_i64("OBJECT"), Err(Error::TypeMismatch { .. })));
        assert_eq!(h.get_f64("BITPIX").unwrap(), 16.0);
    }

    #[test]
    fn malformed_card_degrades_to_invalid() {
        let raw = block(&["SIMPLE  =                    T", "BAD     = what is this", "END"]);
        let h = Header::parse(&raw, &Config::default()).unwrap();
        assert!(h.cards()[1].is_invalid());
        assert!(!h.contains("BAD"));
        assert_eq!(h.to_bytes(), raw);
    }

    #[test]
    fn malformed_card_is_fatal_in_strict_mode() {
        let raw = block(&["SIMPLE  =                    T", "BAD     = what is this", "END"]);
        let err = Header::parse_at(&raw, 2880, &Config::default().strict(true)).unwrap_err();
        assert!(matches!(err, Error::MalformedCard { offset: 2960, .. }));
    }

    #[test]
    fn text_after_end_is_preserved() {
        let raw = block(&["SIMPLE  =                    T", "END", "garbage after end"]);
        let h = Header::parse(&raw, &Config::default()).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.to_bytes(), raw);
        assert_eq!(h.byte_len(), raw.len());
        let mut edited = h.clone();
        edited.set("OBJECT", "M31", None).unwrap();
        let bytes = edited.to_bytes();
        assert_eq!(&bytes[2 * CARD_SIZE..2 * CARD_SIZE + 3], b"END");
        assert_eq!(&bytes[3 * CARD_SIZE..3 * CARD_SIZE + 17], b"garbage after end");
        assert!(Header::parse(&raw, &Config::default().strict(true)).is_err());
    }

    #[test]
    fn continue_chain_is_one_card() {
        let raw = block(&[
            "SIMPLE  =                    T",
            "LONG    = 'abc&'",
            "CONTINUE  'def&'",
            "CONTINUE  'ghi'",
            "END",
        ]);
        let h = Header::parse(&raw, &Config::default()).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.get_str("LONG").unwrap(), "abcdefghi");
        assert_eq!(h.to_bytes(), raw);
    }

    #[test]
    fn header_len_finds_end_block() {
        let mut raw = block(&["SIMPLE  =                    T"]);
        assert_eq!(header_len(&raw), None);
        raw.extend(block(&["END"]));
        assert_eq!(header_len(&raw), Some(2 * BLOCK_SIZE));
    }

    // ---- editing ----

    #[test]
    fn set_updates_in_place() {
        let mut h = parsed();
        h.set("NAXIS1", 12i64, None).unwrap();
        assert_eq!(h.position("NAXIS1"), Some(3));
        assert_eq!(h.get_i64("NAXIS1").unwrap(), 12);
        assert!(h.is_modified());
    }

    #[test]
    fn set_identical_value_is_noop() {
        let mut h = parsed();
        let rev = h.layout_revision();
        h.set("NAXIS1", 10i64, None).unwrap();
        assert!(!h.is_modified());
        assert_eq!(h.layout_revision(), rev);
        assert_eq!(h.to_bytes(), sample());
    }

    #[test]
    fn set_keeps_comment_unless_given() {
        let mut h = parsed();
        h.set("OBJECT", "M32", None).unwrap();
        assert_eq!(h.card("OBJECT").and_then(Card::comment), Some("target"));
        h.set("OBJECT", "M32", Some("galaxy")).unwrap();
        assert_eq!(h.card("OBJECT").and_then(Card::comment), Some("galaxy"));
    }

    #[test]
    fn set_new_keyword_appends() {
        let mut h = parsed();
        h.set("EXPTIME", 30.0, Some("seconds")).unwrap();
        assert_eq!(h.position("EXPTIME"), Some(8));
        assert_eq!(h.get_f64("EXPTIME").unwrap(), 30.0);
    }

    #[test]
    fn append_reuses_trailing_blanks() {
        let raw = block(&["SIMPLE  =                    T", "", "", "END"]);
        let mut h = Header::parse(&raw, &Config::default()).unwrap();
        h.set("A", 1i64, None).unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.position("A"), Some(1));
        assert_eq!(h.count(""), 1);
    }

    #[test]
    fn set_at_moves_cards() {
        let mut h = parsed();
        h.set_at("EXPTIME", 1.5, None, Placement::After(Anchor::Keyword("NAXIS2"))).unwrap();
        assert_eq!(h.position("EXPTIME"), Some(5));
        h.set_at("OBJECT", "M31", None, Placement::Before(0.into())).unwrap();
        assert_eq!(h.position("OBJECT"), Some(0));
        assert_eq!(h.position("SIMPLE"), Some(1));
        assert!(h.set_at("X", 1i64, None, Placement::Before("NOPE".into())).is_err());
    }

    #[test]
    fn commentary_always_appends() {
        let mut h = parsed();
        h.set("HISTORY", "third", None).unwrap();
        assert_eq!(h.count("HISTORY"), 3);
        h.add_comment(&"x".repeat(100)).unwrap();
        assert_eq!(h.count("COMMENT"), 2);
        assert_eq!(h.card_nth("COMMENT", 1).and_then(Card::comment).map(str::len), Some(28));
    }

    #[test]
    fn delete_is_silent_when_absent() {
        let mut h = parsed();
        assert!(!h.delete("NOPE"));
        assert!(!h.is_modified());
        assert!(h.delete_nth("HISTORY", 1));
        assert_eq!(h.count("HISTORY"), 1);
        assert_eq!(h.position("OBJECT"), Some(5));
    }

    #[test]
    fn rename_keeps_position() {
        let mut h = parsed();
        h.rename("OBJECT", "TARGET").unwrap();
        assert_eq!(h.position("TARGET"), Some(5));
        assert!(!h.contains("OBJECT"));
        assert!(h.rename("TARGET", "NAXIS").is_err());
        assert!(h.rename("HISTORY", "COMMENT").is_err());
        assert!(matches!(h.rename("NOPE", "X"), Err(Error::KeyNotFound { .. })));
    }

    #[test]
    fn insert_and_remove_reindex() {
        let mut h = parsed();
        h.insert(1, Card::new("EXTEND", true).unwrap()).unwrap();
        assert_eq!(h.position("BITPIX"), Some(2));
        let card = h.remove(1).unwrap();
        assert_eq!(card.keyword(), "EXTEND");
        assert_eq!(h.position("BITPIX"), Some(1));
        assert!(h.insert(1, Card::end()).is_err());
        assert!(h.remove(99).is_err());
    }

    #[test]
    fn record_valued_keywords() {
        let mut h = Header::new();
        h.set("DP1.NAXES", 2i64, None).unwrap();
        h.set("DP1.AXIS.1", 1i64, None).unwrap();
        assert_eq!(h.get_f64("DP1.AXIS.1").unwrap(), 1.0);
        assert_eq!(h.get_f64("dp1.naxes").unwrap(), 2.0);
        assert_eq!(h.count("DP1"), 2);
        h.set("DP1.AXIS.1", 3.0, None).unwrap();
        assert_eq!(h.count("DP1"), 2);
        assert_eq!(h.get_f64("DP1.AXIS.1").unwrap(), 3.0);
    }

    #[test]
    fn layout_keywords_bump_revision() {
        let mut h = parsed();
        let rev = h.layout_revision();
        h.set("OBJECT", "M33", None).unwrap();
        assert_eq!(h.layout_revision(), rev);
        h.set("NAXIS2", 5i64, None).unwrap();
        assert!(h.layout_revision() > rev);
    }

    // ---- serialization ----

    #[test]
    fn serialized_length_is_whole_blocks() {
        let mut h = Header::new();
        for i in 0..40 {
            h.set(&format!("KEY{i}"), i as i64, None).unwrap();
        }
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
        assert_eq!(h.byte_len(), bytes.len());
        assert_eq!(&bytes[40 * CARD_SIZE..40 * CARD_SIZE + 3], b"END");
        let back = Header::parse(&bytes, &Config::default()).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn overlong_comment_serializes_as_stored() {
        let mut h = Header::new();
        h.set("EXPTIME", 1.5, Some(&"x".repeat(100))).unwrap();
        let stored = h.card("EXPTIME").unwrap().comment().unwrap().to_string();
        assert_eq!(stored.len(), 47);
        let back = Header::parse(&h.to_bytes(), &Config::default()).unwrap();
        assert_eq!(back.card("EXPTIME").unwrap().comment(), Some(stored.as_str()));
        assert_eq!(back, h);
    }

    #[test]
    fn display_prints_one_card_per_line() {
        let h = parsed();
        let text = h.to_string();
        assert_eq!(text.lines().count(), 9);
        assert!(text.lines().all(|l| l.len() <= CARD_SIZE));
        assert_eq!(text.lines().last(), Some("END"));
    }
}
