// codec.rs — line framing and the request field extractor
//
// A request is one LF-terminated line (CRs stripped). The extractor is not a
// JSON parser: it locates `"key"` verbatim, skips whitespace and a colon,
// and reads the value in place. Integer fields additionally accept
// `0x`-prefixed hex, which is why requests do not go through serde_json.
// Responses *are* built with serde_json — they are plain JSON going out.
//
// Missing and malformed fields are both reported as `None`; the dispatcher
// decides whether absence is fatal for a given command.

use std::io::{self, BufRead, BufReader, Read, Write};

use serde::Serialize;
use serde_json::Value;

/// Request lines are capped at this many bytes. Longer lines are still
/// consumed up to the next newline, but flagged so the dispatcher can
/// reject them instead of acting on partial fields.
pub const MAX_LINE: usize = 4096;

// ── field extractor ───────────────────────────────────────────────────────────

/// Position the cursor just after `"key"` + optional whitespace + `:` +
/// optional whitespace. Returns the remainder of the line, or `None` when
/// the key (or its colon) is absent.
fn find_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("\"{key}\"");
    let start = line.find(&pattern)? + pattern.len();
    let rest = line[start..].trim_start();
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim_start())
}

fn split_digits(s: &str, radix: u32) -> Option<(u64, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = u64::from_str_radix(&s[..end], radix).ok()?;
    Some((value, &s[end..]))
}

/// Unsigned magnitude parse: decimal, or hex with a `0x`/`0X` prefix.
/// Stops at the first non-digit, like the rest of the extractor.
fn parse_magnitude(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        split_digits(hex, 16).map(|(v, _)| v)
    } else {
        split_digits(s, 10).map(|(v, _)| v)
    }
}

/// Signed integer field: decimal or `0x` hex, optional leading minus.
pub fn get_int(line: &str, key: &str) -> Option<i64> {
    let v = find_value(line, key)?;
    if let Some(rest) = v.strip_prefix('-') {
        let magnitude = parse_magnitude(rest)?;
        i64::try_from(magnitude).ok().map(|m| -m)
    } else {
        let magnitude = parse_magnitude(v)?;
        i64::try_from(magnitude).ok()
    }
}

/// Unsigned 32-bit field: decimal or `0x` hex, range-checked. Sign and
/// overflow are malformed, i.e. not-present.
pub fn get_u32(line: &str, key: &str) -> Option<u32> {
    let v = find_value(line, key)?;
    u32::try_from(parse_magnitude(v)?).ok()
}

/// Boolean field: the literals `true`/`false`, or any integer (nonzero is
/// true).
pub fn get_bool(line: &str, key: &str) -> Option<bool> {
    let v = find_value(line, key)?;
    if v.starts_with("true") {
        return Some(true);
    }
    if v.starts_with("false") {
        return Some(false);
    }
    get_int(line, key).map(|n| n != 0)
}

/// String field: requires a leading quote, reads to the next unescaped
/// quote. A backslash defers the quote test by one — the following
/// character is taken verbatim (no JSON-grade unescaping).
pub fn get_str(line: &str, key: &str) -> Option<String> {
    let v = find_value(line, key)?;
    let mut chars = v.strip_prefix('"')?.chars();
    let mut out = String::new();
    loop {
        match chars.next()? {
            '"' => return Some(out),
            '\\' => out.push(chars.next()?),
            c => out.push(c),
        }
    }
}

// ── line reader ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub text: String,
    /// The line exceeded `MAX_LINE`; `text` holds the first `MAX_LINE`
    /// bytes and the excess up to the newline was discarded.
    pub truncated: bool,
}

/// Reads LF-terminated request lines from a stream, stripping CRs and
/// capping each line at `MAX_LINE` bytes. Partial-line state survives
/// `WouldBlock`/`TimedOut` errors so a read timeout mid-line loses nothing.
pub struct LineReader<R: Read> {
    inner: BufReader<R>,
    partial: Vec<u8>,
    overflowed: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
            partial: Vec::new(),
            overflowed: false,
        }
    }

    /// Next complete line, or `None` on EOF. A partial line at EOF is
    /// discarded — the peer hung up mid-request.
    pub fn next_line(&mut self) -> io::Result<Option<RequestLine>> {
        loop {
            let buf = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if buf.is_empty() {
                return Ok(None);
            }

            let newline = buf.iter().position(|&b| b == b'\n');
            let take = newline.map(|i| i + 1).unwrap_or(buf.len());
            for &b in &buf[..take] {
                if b == b'\r' || b == b'\n' {
                    continue;
                }
                if self.partial.len() < MAX_LINE {
                    self.partial.push(b);
                } else {
                    self.overflowed = true;
                }
            }
            self.inner.consume(take);

            if newline.is_some() {
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                let truncated = std::mem::take(&mut self.overflowed);
                return Ok(Some(RequestLine { text, truncated }));
            }
        }
    }
}

// ── responses ─────────────────────────────────────────────────────────────────

/// One response envelope. Exactly one of result/error appears on the wire;
/// a successful command with nothing to report omits `result` entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    pub body: Result<Option<Value>, String>,
}

impl Response {
    pub fn ok(id: i64) -> Self {
        Self { id, body: Ok(None) }
    }

    pub fn ok_with(id: i64, result: Value) -> Self {
        Self {
            id,
            body: Ok(Some(result)),
        }
    }

    pub fn err(id: i64, error: impl Into<String>) -> Self {
        Self {
            id,
            body: Err(error.into()),
        }
    }

    /// Single-line JSON, LF-terminated. The envelope field order
    /// (`id`, `ok`, then `result`/`error`) comes from the struct.
    pub fn to_line(&self) -> String {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: i64,
            ok: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            result: Option<&'a Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<&'a str>,
        }

        let wire = match &self.body {
            Ok(result) => Wire {
                id: self.id,
                ok: true,
                result: result.as_ref(),
                error: None,
            },
            Err(error) => Wire {
                id: self.id,
                ok: false,
                result: None,
                error: Some(error),
            },
        };
        let mut line = serde_json::to_string(&wire).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Write the full line; `write_all` already retries on interruption.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(self.to_line().as_bytes())?;
        w.flush()
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_decimal_and_hex() {
        assert_eq!(get_int(r#"{"count": 42}"#, "count"), Some(42));
        assert_eq!(get_int(r#"{"addr":0x80001000}"#, "addr"), Some(0x8000_1000));
        assert_eq!(get_int(r#"{"x": -128}"#, "x"), Some(-128));
        assert_eq!(get_int(r#"{"x": -0x10}"#, "x"), Some(-16));
    }

    #[test]
    fn int_trailing_garbage_stops_at_first_nondigit() {
        assert_eq!(get_int(r#"{"count":3,"cmd":"x"}"#, "count"), Some(3));
    }

    #[test]
    fn int_missing_or_malformed_is_none() {
        assert_eq!(get_int(r#"{"cmd":"status"}"#, "count"), None);
        assert_eq!(get_int(r#"{"count": "nope"}"#, "count"), None);
        assert_eq!(get_int(r#"{"count"  42}"#, "count"), None);
        assert_eq!(get_int(r#"{"count": 0x}"#, "count"), None);
    }

    #[test]
    fn u32_range_checked() {
        assert_eq!(get_u32(r#"{"input":0xFFFFFFFF}"#, "input"), Some(u32::MAX));
        assert_eq!(get_u32(r#"{"input":4294967296}"#, "input"), None);
        assert_eq!(get_u32(r#"{"input":-1}"#, "input"), None);
    }

    #[test]
    fn bool_literals_and_integers() {
        assert_eq!(get_bool(r#"{"enabled":true}"#, "enabled"), Some(true));
        assert_eq!(get_bool(r#"{"enabled":false}"#, "enabled"), Some(false));
        assert_eq!(get_bool(r#"{"enabled":0}"#, "enabled"), Some(false));
        assert_eq!(get_bool(r#"{"enabled":7}"#, "enabled"), Some(true));
        assert_eq!(get_bool(r#"{"enabled":"yes"}"#, "enabled"), None);
    }

    #[test]
    fn str_reads_until_unescaped_quote() {
        assert_eq!(
            get_str(r#"{"cmd":"save_state","path":"/tmp/x.st"}"#, "cmd"),
            Some("save_state".into())
        );
        assert_eq!(
            get_str(r#"{"path":"a\"b"}"#, "path"),
            Some(r#"a"b"#.into())
        );
        // escapes collapse to the following char verbatim
        assert_eq!(get_str(r#"{"path":"a\nb"}"#, "path"), Some("anb".into()));
    }

    #[test]
    fn str_unterminated_or_unquoted_is_none() {
        assert_eq!(get_str(r#"{"path":"/tmp/x"#, "path"), None);
        assert_eq!(get_str(r#"{"path":42}"#, "path"), None);
    }

    #[test]
    fn line_reader_strips_cr_and_splits_lines() {
        let data = b"{\"id\":1}\r\n\n{\"id\":2}\n".to_vec();
        let mut reader = LineReader::new(&data[..]);
        assert_eq!(
            reader.next_line().unwrap().unwrap().text,
            "{\"id\":1}"
        );
        assert_eq!(reader.next_line().unwrap().unwrap().text, "");
        assert_eq!(
            reader.next_line().unwrap().unwrap().text,
            "{\"id\":2}"
        );
        assert!(reader.next_line().unwrap().is_none());
    }

    #[test]
    fn line_reader_caps_and_flags_long_lines() {
        let mut data = vec![b'a'; MAX_LINE + 100];
        data.push(b'\n');
        data.extend_from_slice(b"{\"id\":3}\n");
        let mut reader = LineReader::new(&data[..]);

        let long = reader.next_line().unwrap().unwrap();
        assert!(long.truncated);
        assert_eq!(long.text.len(), MAX_LINE);

        // the next line is intact — the excess did not bleed over
        let next = reader.next_line().unwrap().unwrap();
        assert!(!next.truncated);
        assert_eq!(next.text, "{\"id\":3}");
    }

    #[test]
    fn line_reader_discards_partial_line_at_eof() {
        let data = b"{\"id\":1".to_vec();
        let mut reader = LineReader::new(&data[..]);
        assert!(reader.next_line().unwrap().is_none());
    }

    #[test]
    fn response_wire_shapes() {
        assert_eq!(Response::ok(7).to_line(), "{\"id\":7,\"ok\":true}\n");
        assert_eq!(
            Response::err(9, "unknown command").to_line(),
            "{\"id\":9,\"ok\":false,\"error\":\"unknown command\"}\n"
        );
        let with = Response::ok_with(1, serde_json::json!({ "advanced": 3 }));
        assert_eq!(
            with.to_line(),
            "{\"id\":1,\"ok\":true,\"result\":{\"advanced\":3}}\n"
        );
    }
}
