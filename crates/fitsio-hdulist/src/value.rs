//! The FITS value grammar: tokenizing the value field of a card (columns
//! 11-80) and rendering values back into fixed-format columns.

use std::fmt;

/// A parsed FITS header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// FITS logical value (`T` or `F`).
    Logical(bool),
    /// FITS integer value.
    Integer(i64),
    /// FITS floating-point value.
    Float(f64),
    /// FITS complex integer `(real, imaginary)`.
    ComplexInt(i64, i64),
    /// FITS complex float `(real, imaginary)`.
    ComplexFloat(f64, f64),
    /// FITS character string (content between single quotes).
    String(String),
    /// Value indicator present but the value field is blank.
    Undefined,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer and float values as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Logical(_) => "logical",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::ComplexInt(..) => "complex integer",
            Value::ComplexFloat(..) => "complex float",
            Value::String(_) => "string",
            Value::Undefined => "undefined",
        }
    }

    /// Reasons a value cannot be written into a card, if any.
    pub(crate) fn check_writable(&self) -> std::result::Result<(), String> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(format!("{f} is not representable")),
            Value::ComplexFloat(re, im) if !re.is_finite() || !im.is_finite() => {
                Err(String::from("complex parts must be finite"))
            }
            Value::String(s) => check_text(s),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Logical(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::ComplexInt(re, im) => write!(f, "({re}, {im})"),
            Value::ComplexFloat(re, im) => {
                write!(f, "({}, {})", format_float(*re), format_float(*im))
            }
            Value::String(s) => write!(f, "{s}"),
            Value::Undefined => Ok(()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Header text must be printable ASCII.
pub(crate) fn check_text(s: &str) -> std::result::Result<(), String> {
    match s.bytes().find(|b| !(0x20..=0x7e).contains(b)) {
        Some(b) => Err(format!("byte {b:#04x} is not printable ASCII")),
        None => Ok(()),
    }
}

// ── Parsing ──

/// Tokenize a value field into its value and optional comment.
///
/// `strip` drops trailing blanks from string values; leading blanks are
/// always significant.
pub(crate) fn parse_value_field(
    field: &str,
    strip: bool,
) -> std::result::Result<(Value, Option<String>), String> {
    let text = field.trim_start();
    if let Some(rest) = text.strip_prefix('\'') {
        let (s, after) = parse_quoted(rest)?;
        let s = if strip { s.trim_end().to_string() } else { s };
        return Ok((Value::String(s), comment_after_string(after)?));
    }

    // Non-string tokens never contain a slash, so the first one starts the
    // comment. IDL writes `-32/comment` without the space.
    let (token, comment) = match text.find('/') {
        Some(pos) => (&text[..pos], comment_text(&text[pos + 1..])),
        None => (text, None),
    };
    Ok((parse_token(token.trim())?, comment))
}

/// Scan a quoted string body (opening quote already consumed). Returns the
/// unescaped content and the remainder after the closing quote.
pub(crate) fn parse_quoted(body: &str) -> std::result::Result<(String, &str), String> {
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            return Ok((out, &body[i + 1..]));
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    Err(String::from("unterminated string"))
}

pub(crate) fn comment_after_string(after: &str) -> std::result::Result<Option<String>, String> {
    let rest = after.trim_start();
    if rest.is_empty() {
        return Ok(None);
    }
    match rest.strip_prefix('/') {
        Some(c) => Ok(comment_text(c)),
        None => Err(format!("unexpected text after string: {rest:?}")),
    }
}

/// Comment text after the slash: one optional leading space is part of the
/// separator, trailing blanks are padding.
fn comment_text(s: &str) -> Option<String> {
    let s = s.strip_prefix(' ').unwrap_or(s).trim_end();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_token(token: &str) -> std::result::Result<Value, String> {
    match token {
        "" => return Ok(Value::Undefined),
        "T" => return Ok(Value::Logical(true)),
        "F" => return Ok(Value::Logical(false)),
        _ => {}
    }
    if token.starts_with('(') {
        return parse_complex(token).ok_or_else(|| format!("malformed complex value {token:?}"));
    }
    parse_number(token).ok_or_else(|| format!("cannot parse value {token:?}"))
}

fn parse_number(token: &str) -> Option<Value> {
    if !token
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'E' | b'e' | b'D' | b'd'))
    {
        return None;
    }
    let looks_integral = !token
        .bytes()
        .any(|b| matches!(b, b'.' | b'E' | b'e' | b'D' | b'd'));
    if looks_integral {
        if let Ok(n) = token.parse::<i64>() {
            return Some(Value::Integer(n));
        }
    }
    parse_float_str(token).map(Value::Float)
}

/// A bare integer or float token as `f64`.
pub(crate) fn parse_real(token: &str) -> Option<f64> {
    parse_number(token.trim()).and_then(|v| v.as_f64())
}

/// Parse a float string, handling FITS `D` exponent notation.
fn parse_float_str(s: &str) -> Option<f64> {
    let normalized = s.replace(['D', 'd'], "E");
    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_complex(text: &str) -> Option<Value> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (left, right) = inner.split_once(',')?;
    match (parse_number(left.trim())?, parse_number(right.trim())?) {
        (Value::Integer(re), Value::Integer(im)) => Some(Value::ComplexInt(re, im)),
        (re, im) => Some(Value::ComplexFloat(re.as_f64()?, im.as_f64()?)),
    }
}

// ── Rendering ──

/// Double embedded quotes for a FITS string literal.
pub(crate) fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Render a value in fixed format, starting at column 11.
///
/// Logical and numeric values are right-justified to column 30; strings
/// open with a quote in column 11 and hold at least 8 characters.
pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{:<8}'", escape_string(s)),
        Value::Undefined => String::new(),
        other => format!("{:>20}", other.to_string()),
    }
}

/// Shortest decimal form that parses back to the same `f64`, with an
/// upper-case exponent and a guaranteed decimal point.
pub(crate) fn format_float(f: f64) -> String {
    let repr = format!("{f:?}");
    let repr = match repr.split_once('e') {
        Some((mantissa, exp)) if mantissa.contains('.') => format!("{mantissa}E{exp}"),
        Some((mantissa, exp)) => format!("{mantissa}.0E{exp}"),
        None => repr,
    };
    if repr.len() <= 20 {
        return repr;
    }
    let mut precision = 16usize;
    loop {
        let s = format!("{f:.precision$E}");
        if s.len() <= 20 || precision == 0 {
            return s;
        }
        precision -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(field: &str) -> (Value, Option<String>) {
        parse_value_field(field, true).unwrap()
    }

    // ---- Logical ----

    #[test]
    fn parse_logical() {
        assert_eq!(parse("                   T").0, Value::Logical(true));
        let (v, c) = parse("                   F / this is a flag");
        assert_eq!(v, Value::Logical(false));
        assert_eq!(c.as_deref(), Some("this is a flag"));
    }

    // ---- Integer ----

    #[test]
    fn parse_integers() {
        assert_eq!(parse("                  42").0, Value::Integer(42));
        assert_eq!(parse("                 -99").0, Value::Integer(-99));
        let (v, c) = parse("                1024 / block count");
        assert_eq!(v, Value::Integer(1024));
        assert_eq!(c.as_deref(), Some("block count"));
    }

    #[test]
    fn comment_without_space_before_slash() {
        let (v, c) = parse("                 -32/No. of bits per pixel");
        assert_eq!(v, Value::Integer(-32));
        assert_eq!(c.as_deref(), Some("No. of bits per pixel"));
    }

    #[test]
    fn integer_overflow_falls_back_to_float() {
        let (v, _) = parse("99999999999999999999");
        assert_eq!(v, Value::Float(1e20));
    }

    // ---- Float ----

    #[test]
    fn parse_floats() {
        assert_eq!(parse("                 3.5").0, Value::Float(3.5));
        assert_eq!(parse("             1.0E-10").0, Value::Float(1e-10));
        assert_eq!(parse("            2.5D+03").0, Value::Float(2500.0));
        assert_eq!(parse("                  1.").0, Value::Float(1.0));
    }

    #[test]
    fn reject_words() {
        assert!(parse_value_field("                 abc", true).is_err());
        assert!(parse_value_field("                 nan", true).is_err());
        assert!(parse_value_field("                 inf", true).is_err());
    }

    // ---- Complex ----

    #[test]
    fn parse_complex_values() {
        assert_eq!(parse("             (1, -2)").0, Value::ComplexInt(1, -2));
        assert_eq!(
            parse("         (1.5, 2.0E1)").0,
            Value::ComplexFloat(1.5, 20.0)
        );
        assert!(parse_value_field("(1.5 2.0)", true).is_err());
    }

    // ---- String ----

    #[test]
    fn parse_strings() {
        let (v, c) = parse("'IMAGE   '           / extension type");
        assert_eq!(v, Value::String("IMAGE".into()));
        assert_eq!(c.as_deref(), Some("extension type"));
    }

    #[test]
    fn parse_string_doubled_quotes() {
        let (v, _) = parse("'O''HARA '");
        assert_eq!(v, Value::String("O'HARA".into()));
    }

    #[test]
    fn parse_string_keeps_leading_blanks() {
        let (v, _) = parse("'  abc   '");
        assert_eq!(v, Value::String("  abc".into()));
    }

    #[test]
    fn parse_string_without_strip() {
        let (v, _) = parse_value_field("'abc     '", false).unwrap();
        assert_eq!(v, Value::String("abc     ".into()));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(parse_value_field("'never closed", true).is_err());
    }

    #[test]
    fn garbage_after_string_is_an_error() {
        assert!(parse_value_field("'abc' xyz", true).is_err());
    }

    // ---- Undefined ----

    #[test]
    fn blank_field_is_undefined() {
        let (v, c) = parse("                     / nothing here");
        assert_eq!(v, Value::Undefined);
        assert_eq!(c.as_deref(), Some("nothing here"));
    }

    // ---- Rendering ----

    #[test]
    fn format_fixed_columns() {
        assert_eq!(format_value(&Value::Logical(true)), format!("{:>20}", "T"));
        assert_eq!(format_value(&Value::Integer(-7)).len(), 20);
        assert_eq!(format_value(&Value::String("A".into())), "'A       '");
        assert_eq!(format_value(&Value::String("it's".into())), "'it''s   '");
        assert_eq!(format_value(&Value::Undefined), "");
    }

    #[test]
    fn format_float_round_trips() {
        for f in [0.1, -2.5, 1e-20, 6.02214076e23, 1.0, 123456.789, 1.5e300] {
            let s = format_float(f);
            assert!(s.len() <= 20, "{s} too long");
            assert!(s.contains('.'), "{s} lacks a decimal point");
            let back = parse_value_field(&s, true).unwrap().0;
            assert_eq!(back, Value::Float(f), "{s}");
        }
    }

    #[test]
    fn non_finite_floats_are_not_writable() {
        assert!(Value::Float(f64::NAN).check_writable().is_err());
        assert!(Value::Float(1.0).check_writable().is_ok());
        assert!(Value::String("caf\u{e9}".into()).check_writable().is_err());
    }
}
