use crate::error::HarnessError;

/* ============================= TYPES ============================= */

/// A literal argument inside a `submit(...)` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The single call extracted from a fenced code block.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitCall {
    pub api_name: String,
    pub args: Vec<Literal>,
}

/* ============================= ENCODING ============================= */

/// Encode a literal so that `parse` round-trips it exactly. Strings are
/// double-quoted with backslash escapes; backticks are hex-escaped so the
/// encoded form can never terminate the surrounding fence.
pub fn encode_literal(value: &Literal) -> String {
    match value {
        Literal::Str(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    '`' => out.push_str("\\x60"),
                    other => out.push(other),
                }
            }
            out.push('"');
            out
        }
        Literal::Int(n) => n.to_string(),
        Literal::Float(f) => format!("{f:?}"),
        Literal::Bool(b) => b.to_string(),
        Literal::List(items) => {
            let inner: Vec<String> = items.iter().map(encode_literal).collect();
            format!("[{}]", inner.join(", "))
        }
    }
}

/// Wrap an agent-provided solution string into the wire format consumed by
/// the conductor: a fenced code block holding one `submit(<literal>)` call.
pub fn wrap_submission(solution: &str) -> String {
    format!(
        "```\nsubmit({})\n```",
        encode_literal(&Literal::Str(solution.to_string()))
    )
}

/* ============================= PARSING ============================= */

/// Extract and parse the first fenced code block as a single
/// `identifier(literal, ...)` call.
pub fn parse(input: &str) -> Result<SubmitCall, HarnessError> {
    let body = extract_fenced_block(input)?;
    if body.trim().is_empty() {
        return Err(HarnessError::Parse("empty code block".into()));
    }
    let mut cursor = Cursor::new(body);
    cursor.skip_whitespace();

    let api_name = cursor.parse_identifier()?;
    cursor.skip_whitespace();
    cursor.expect('(')?;

    let mut args = Vec::new();
    cursor.skip_whitespace();
    if cursor.peek() != Some(')') {
        loop {
            cursor.skip_whitespace();
            args.push(cursor.parse_literal()?);
            cursor.skip_whitespace();
            match cursor.peek() {
                Some(',') => {
                    cursor.advance();
                }
                Some(')') => break,
                Some(c) => {
                    return Err(HarnessError::Parse(format!(
                        "expected ',' or ')' in argument list, found {c:?}"
                    )));
                }
                None => return Err(HarnessError::Parse("unclosed argument list".into())),
            }
        }
    }
    cursor.expect(')')?;

    cursor.skip_whitespace();
    if cursor.peek().is_some() {
        return Err(HarnessError::Parse(
            "expected exactly one call in the code block".into(),
        ));
    }

    Ok(SubmitCall { api_name, args })
}

fn extract_fenced_block(input: &str) -> Result<&str, HarnessError> {
    let open = input
        .find("```")
        .ok_or_else(|| HarnessError::Parse("no fenced code block found".into()))?;
    let after_fence = &input[open + 3..];
    // An optional language tag occupies the rest of the fence line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
    let body = &after_fence[body_start..];
    let close = body
        .find("```")
        .ok_or_else(|| HarnessError::Parse("unterminated fenced code block".into()))?;
    Ok(&body[..close])
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), HarnessError> {
        match self.advance() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(HarnessError::Parse(format!(
                "expected {expected:?}, found {c:?}"
            ))),
            None => Err(HarnessError::Parse(format!(
                "expected {expected:?}, found end of input"
            ))),
        }
    }

    fn parse_identifier(&mut self) -> Result<String, HarnessError> {
        let mut name = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                name.push(c);
                self.pos += 1;
            }
            _ => return Err(HarnessError::Parse("expected an identifier".into())),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(name)
    }

    fn parse_literal(&mut self) -> Result<Literal, HarnessError> {
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string().map(Literal::Str),
            Some('[') => self.parse_list(),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_keyword(),
            Some(c) => Err(HarnessError::Parse(format!("unexpected character {c:?}"))),
            None => Err(HarnessError::Parse("expected a literal, found end of input".into())),
        }
    }

    fn parse_string(&mut self) -> Result<String, HarnessError> {
        let quote = self.advance().expect("caller checked for a quote");
        let mut out = String::new();
        loop {
            match self.advance() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('`') => out.push('`'),
                    Some('x') => {
                        let hi = self.advance();
                        let lo = self.advance();
                        let (Some(hi), Some(lo)) = (hi, lo) else {
                            return Err(HarnessError::Parse("truncated \\x escape".into()));
                        };
                        let code = u32::from_str_radix(&format!("{hi}{lo}"), 16)
                            .map_err(|_| HarnessError::Parse("invalid \\x escape".into()))?;
                        out.push(
                            char::from_u32(code)
                                .ok_or_else(|| HarnessError::Parse("invalid \\x escape".into()))?,
                        );
                    }
                    Some(other) => {
                        return Err(HarnessError::Parse(format!("unknown escape \\{other}")));
                    }
                    None => return Err(HarnessError::Parse("unterminated string literal".into())),
                },
                Some(c) => out.push(c),
                None => return Err(HarnessError::Parse("unterminated string literal".into())),
            }
        }
    }

    fn parse_list(&mut self) -> Result<Literal, HarnessError> {
        self.expect('[')?;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.advance();
            return Ok(Literal::List(items));
        }
        loop {
            self.skip_whitespace();
            items.push(self.parse_literal()?);
            self.skip_whitespace();
            match self.advance() {
                Some(',') => continue,
                Some(']') => return Ok(Literal::List(items)),
                Some(c) => {
                    return Err(HarnessError::Parse(format!(
                        "expected ',' or ']' in list, found {c:?}"
                    )));
                }
                None => return Err(HarnessError::Parse("unclosed list literal".into())),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Literal, HarnessError> {
        let mut raw = String::new();
        if matches!(self.peek(), Some('-') | Some('+')) {
            raw.push(self.advance().expect("sign peeked"));
        }
        let mut seen_exp = false;
        while let Some(c) = self.peek() {
            let take = c.is_ascii_digit()
                || c == '.'
                || c == 'e'
                || c == 'E'
                || (seen_exp && (c == '-' || c == '+'));
            if !take {
                break;
            }
            if c == 'e' || c == 'E' {
                seen_exp = true;
            } else if c != '-' && c != '+' {
                seen_exp = false;
            }
            raw.push(c);
            self.pos += 1;
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Literal::Int(n));
        }
        raw.parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| HarnessError::Parse(format!("invalid number literal {raw:?}")))
    }

    fn parse_keyword(&mut self) -> Result<Literal, HarnessError> {
        let word = self.parse_identifier()?;
        match word.as_str() {
            "true" | "True" => Ok(Literal::Bool(true)),
            "false" | "False" => Ok(Literal::Bool(false)),
            other => Err(HarnessError::Parse(format!("unknown keyword {other:?}"))),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn fenced(call: &str) -> String {
        format!("```\n{call}\n```")
    }

    #[test]
    fn test_parse_simple_string_arg() {
        let call = parse(&fenced("submit(\"Yes\")")).unwrap();
        assert_eq!(call.api_name, "submit");
        assert_eq!(call.args, vec![Literal::Str("Yes".into())]);
    }

    #[test]
    fn test_parse_single_quoted_string() {
        let call = parse(&fenced("submit('geo')")).unwrap();
        assert_eq!(call.args, vec![Literal::Str("geo".into())]);
    }

    #[test]
    fn test_parse_numbers_bools_lists() {
        let call = parse(&fenced("submit(3, -1.5, true, [\"a\", \"b\"])")).unwrap();
        assert_eq!(
            call.args,
            vec![
                Literal::Int(3),
                Literal::Float(-1.5),
                Literal::Bool(true),
                Literal::List(vec![Literal::Str("a".into()), Literal::Str("b".into())]),
            ]
        );
    }

    #[test]
    fn test_parse_python_style_booleans() {
        let call = parse(&fenced("submit(True, False)")).unwrap();
        assert_eq!(call.args, vec![Literal::Bool(true), Literal::Bool(false)]);
    }

    #[test]
    fn test_parse_empty_args() {
        let call = parse(&fenced("submit()")).unwrap();
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_parse_language_tag_is_skipped() {
        let call = parse("```python\nsubmit(\"No\")\n```").unwrap();
        assert_eq!(call.args, vec![Literal::Str("No".into())]);
    }

    #[test]
    fn test_parse_uses_first_fenced_block() {
        let input = "```\nsubmit(\"Yes\")\n```\nsome trailing prose";
        assert!(parse(input).is_ok());
    }

    // ── Round trips ──

    fn round_trip(s: &str) {
        let wrapped = wrap_submission(s);
        let call = parse(&wrapped).unwrap();
        assert_eq!(call.api_name, "submit");
        assert_eq!(call.args, vec![Literal::Str(s.to_string())]);
    }

    #[test]
    fn test_round_trip_plain() {
        round_trip("Yes");
        round_trip("geo");
        round_trip("");
    }

    #[test]
    fn test_round_trip_quotes_and_newlines() {
        round_trip("it's \"quoted\"\nwith lines\tand tabs");
    }

    #[test]
    fn test_round_trip_backticks() {
        round_trip("run ```kubectl get pods``` first");
        round_trip("```");
    }

    #[test]
    fn test_round_trip_backslashes() {
        round_trip("C:\\path\\to\\thing \\n not a newline");
    }

    #[test]
    fn test_round_trip_list_literal() {
        let lit = Literal::List(vec![Literal::Str("geo".into()), Literal::Str("rate".into())]);
        let wrapped = format!("```\nsubmit({})\n```", encode_literal(&lit));
        let call = parse(&wrapped).unwrap();
        assert_eq!(call.args, vec![lit]);
    }

    // ── Rejections ──

    #[test]
    fn test_reject_no_fence() {
        assert!(parse("submit(\"Yes\")").is_err());
    }

    #[test]
    fn test_reject_empty_block() {
        assert!(parse("```\n\n```").is_err());
    }

    #[test]
    fn test_reject_multiple_calls() {
        assert!(parse(&fenced("submit(\"a\")\nsubmit(\"b\")")).is_err());
    }

    #[test]
    fn test_reject_unclosed_paren() {
        assert!(parse(&fenced("submit(\"a\"")).is_err());
    }

    #[test]
    fn test_reject_unclosed_quote() {
        assert!(parse(&fenced("submit(\"a)")).is_err());
    }

    #[test]
    fn test_reject_bad_identifier() {
        assert!(parse(&fenced("2submit(\"a\")")).is_err());
    }

    #[test]
    fn test_reject_trailing_garbage() {
        assert!(parse(&fenced("submit(\"a\") extra")).is_err());
    }
}
