//! Parser for the stringified Python argument tuples carried in audit
//! records. The producer stringifies arbitrary runtime objects, so this
//! parser is deliberately tolerant: anything it cannot type precisely
//! (object reprs, floats, dicts) becomes `Value::Other` with the raw text,
//! and callers keep a regex fallback for lines it rejects outright.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    Other(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Parses the textual form of an argument tuple, e.g.
/// `('/tmp/x', 'w', 524865)` or `(<socket.socket fd=3>, ('pypi.org', 443))`.
/// Returns `None` when the text is not a recognizable literal; the caller
/// then falls back to regex extraction over the raw text.
pub fn parse_args(text: &str) -> Option<Vec<Value>> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    let values = match parser.peek()? {
        b'(' | b'[' => match parser.parse_value()? {
            Value::Tuple(items) => items,
            other => vec![other],
        },
        _ => vec![parser.parse_value()?],
    };
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return None;
    }
    Some(values)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            b'(' => self.parse_seq(b'(', b')'),
            b'[' => self.parse_seq(b'[', b']'),
            b'\'' | b'"' => self.parse_str().map(Value::Str),
            b'b' | b'B' if matches!(self.src.get(self.pos + 1), Some(b'\'' | b'"')) => {
                self.pos += 1;
                self.parse_bytes().map(Value::Bytes)
            }
            b'<' => self.parse_angle(),
            b'{' => self.parse_balanced(b'{', b'}'),
            b'-' | b'0'..=b'9' => self.parse_number(),
            _ => self.parse_ident(),
        }
    }

    fn parse_seq(&mut self, open: u8, close: u8) -> Option<Value> {
        debug_assert_eq!(self.peek(), Some(open));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek()? {
                byte if byte == close => {
                    self.pos += 1;
                    return Some(Value::Tuple(items));
                }
                b',' => {
                    self.pos += 1;
                }
                _ => items.push(self.parse_value()?),
            }
        }
    }

    fn parse_str(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                byte if byte == quote => return Some(out),
                b'\\' => match self.bump()? {
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'r' => out.push('\r'),
                    b'0' => out.push('\0'),
                    b'\\' => out.push('\\'),
                    b'\'' => out.push('\''),
                    b'"' => out.push('"'),
                    b'x' => {
                        let hi = self.bump()?;
                        let lo = self.bump()?;
                        let code = hex_value(hi)? * 16 + hex_value(lo)?;
                        out.push(code as u8 as char);
                    }
                    // Python reprs keep unrecognized escapes verbatim.
                    other => {
                        out.push('\\');
                        out.push(other as char);
                    }
                },
                byte => {
                    // Re-assemble multi-byte UTF-8 sequences.
                    if byte < 0x80 {
                        out.push(byte as char);
                    } else {
                        let start = self.pos - 1;
                        let len = utf8_len(byte);
                        let end = (start + len).min(self.src.len());
                        out.push_str(&String::from_utf8_lossy(&self.src[start..end]));
                        self.pos = end;
                    }
                }
            }
        }
    }

    fn parse_bytes(&mut self) -> Option<Vec<u8>> {
        let quote = self.bump()?;
        let mut out = Vec::new();
        loop {
            match self.bump()? {
                byte if byte == quote => return Some(out),
                b'\\' => match self.bump()? {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'0' => out.push(0),
                    b'\\' => out.push(b'\\'),
                    b'\'' => out.push(b'\''),
                    b'"' => out.push(b'"'),
                    b'x' => {
                        let hi = self.bump()?;
                        let lo = self.bump()?;
                        out.push(hex_value(hi)? * 16 + hex_value(lo)?);
                    }
                    other => {
                        out.push(b'\\');
                        out.push(other);
                    }
                },
                byte => out.push(byte),
            }
        }
    }

    /// Object reprs like `<socket.socket fd=3 ...>` become `Other` with the
    /// raw text, angle brackets balanced.
    fn parse_angle(&mut self) -> Option<Value> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match self.bump()? {
                b'<' => depth += 1,
                b'>' => {
                    depth -= 1;
                    if depth == 0 {
                        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                        return Some(Value::Other(text));
                    }
                }
                _ => {}
            }
        }
    }

    /// Dict/set reprs are consumed as balanced text and kept opaque.
    fn parse_balanced(&mut self, open: u8, close: u8) -> Option<Value> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match self.bump()? {
                byte if byte == open => depth += 1,
                byte if byte == close => {
                    depth -= 1;
                    if depth == 0 {
                        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                        return Some(Value::Other(text));
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_number(&mut self) -> Option<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'_' | b'j')) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
        match text.parse::<i64>() {
            Ok(value) => Some(Value::Int(value)),
            Err(_) => Some(Value::Other(text.to_string())),
        }
    }

    /// Bare identifiers: `True`, `None`, `AF_INET`, dotted names.
    fn parse_ident(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.')
        ) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
        Some(Value::Other(text.to_string()))
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0xF0..=0xF7 => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_style_tuple() {
        let parsed = parse_args("('/tmp/install.log', 'w', 524865)").unwrap();
        assert_eq!(
            parsed,
            vec![
                Value::Str("/tmp/install.log".to_string()),
                Value::Str("w".to_string()),
                Value::Int(524865),
            ]
        );
    }

    #[test]
    fn parses_nested_address_tuple_past_an_object_repr() {
        let parsed = parse_args("(<socket.socket fd=3>, ('pypi.org', 443))").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(matches!(&parsed[0], Value::Other(text) if text.contains("socket.socket")));
        assert_eq!(
            parsed[1],
            Value::Tuple(vec![
                Value::Str("pypi.org".to_string()),
                Value::Int(443),
            ])
        );
    }

    #[test]
    fn parses_bytes_literal() {
        let parsed = parse_args("(b'x', ('1.1.1.1', 53))").unwrap();
        assert_eq!(parsed[0], Value::Bytes(b"x".to_vec()));
    }

    #[test]
    fn parses_list_of_argv_elements() {
        let parsed = parse_args("(['python', '-c', 'print(1)'],)").unwrap();
        assert_eq!(
            parsed,
            vec![Value::Tuple(vec![
                Value::Str("python".to_string()),
                Value::Str("-c".to_string()),
                Value::Str("print(1)".to_string()),
            ])]
        );
    }

    #[test]
    fn escaped_backslash_round_trips() {
        let parsed = parse_args("('\\\\.',)").unwrap();
        assert_eq!(parsed, vec![Value::Str("\\.".to_string())]);
    }

    #[test]
    fn unknown_escape_is_kept_verbatim() {
        let parsed = parse_args("('\\d+',)").unwrap();
        assert_eq!(parsed, vec![Value::Str("\\d+".to_string())]);
    }

    #[test]
    fn hex_escape_decodes() {
        let parsed = parse_args("('\\x41',)").unwrap();
        assert_eq!(parsed, vec![Value::Str("A".to_string())]);
    }

    #[test]
    fn bare_constants_become_other() {
        let parsed = parse_args("(AF_INET, 2)").unwrap();
        assert_eq!(
            parsed,
            vec![Value::Other("AF_INET".to_string()), Value::Int(2)]
        );
    }

    #[test]
    fn floats_become_other() {
        let parsed = parse_args("(1.5,)").unwrap();
        assert_eq!(parsed, vec![Value::Other("1.5".to_string())]);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse_args("('x',) trailing").is_none());
        assert!(parse_args("not a tuple at all!").is_none());
    }
}
