//! Single-pass parser for MI output lines.
//!
//! ```text
//! output-line   ==> stream-record | out-of-band | result-record | "(gdb)"
//! result-record ==> [token] "^" result-class ( "," result )*
//! out-of-band   ==> [token] ( "*" | "+" | "=" ) async-class ( "," result )*
//! stream-record ==> ( "~" | "@" | "&" ) c-string
//! result        ==> variable "=" value
//! value         ==> c-string | tuple | list
//! tuple         ==> "{}" | "{" result ( "," result )* "}"
//! list          ==> "[]" | "[" value ( "," value )* "]" | "[" result ( "," result )* "]"
//! ```
//!
//! GDB reports breakpoints with several locations as `bkpt={..},{..}`, which
//! the grammar does not allow. In the value position of a result, a tuple
//! followed by `,{` continues as a list of tuples.

use crate::{
    error::ParseError,
    record::{AsyncRecord, Record, ResultClass, ResultRecord},
    value::{List, NamedValue, Tuple, Value},
};

const PROMPT: &str = "(gdb)";

/// Classify and parse one line of MI output.
///
/// Trailing `\r`/`\n` are ignored. Lines carrying no MI prefix are returned
/// as [`Record::Raw`].
///
/// # Errors
/// Returns error if the line has an MI prefix but its body is malformed.
pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    let text = line.trim_end_matches(['\r', '\n']);
    if text.trim() == PROMPT {
        return Ok(Record::Prompt);
    }
    let mut cursor = Cursor::new(text);
    match cursor.peek() {
        Some(b'~') => cursor.stream_payload().map(Record::ConsoleStream),
        Some(b'@') => cursor.stream_payload().map(Record::TargetStream),
        Some(b'&') => cursor.stream_payload().map(Record::LogStream),
        _ => cursor.record(),
    }
}

/// Parse a bare `name=value,...` result list, e.g. the body of a result record.
///
/// # Errors
/// Returns error if the text is not a complete result list.
pub fn parse_result_list(text: &str) -> Result<Tuple, ParseError> {
    Cursor::new(text).results_to_end()
}

/// Decode a quoted C-string. Text that does not start with a quote is
/// returned unchanged.
///
/// # Errors
/// Returns error if the string is unterminated or followed by other text.
pub fn parse_c_string(text: &str) -> Result<String, ParseError> {
    let trimmed = text.trim();
    if !trimmed.starts_with('"') {
        return Ok(text.to_string());
    }
    let mut cursor = Cursor::new(trimmed);
    let value = cursor.c_string()?;
    cursor.expect_end()?;
    Ok(value)
}

struct Cursor<'a> {
    raw: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(raw: &'a str) -> Self {
        Self {
            raw,
            bytes: raw.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.pos, message, self.raw)
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error("trailing characters"))
        }
    }

    fn rest(&self) -> &'a str {
        &self.raw[self.pos..]
    }

    /// `~"text"`: the prefix is already known. Unquoted payloads are kept as-is.
    fn stream_payload(&mut self) -> Result<String, ParseError> {
        self.pos += 1;
        if self.peek() != Some(b'"') {
            return Ok(self.rest().to_string());
        }
        let text = self.c_string()?;
        self.expect_end()?;
        Ok(text)
    }

    fn token(&mut self) -> Result<Option<u32>, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        self.raw[start..self.pos]
            .parse()
            .map(Some)
            .map_err(|_| ParseError::new(start, "token out of range", self.raw))
    }

    fn record(&mut self) -> Result<Record, ParseError> {
        let token = match self.token() {
            Ok(token) => token,
            // A long run of digits without a record marker is plain output.
            Err(e) => {
                return match self.peek() {
                    Some(b'^' | b'*' | b'+' | b'=' | b'-') => Err(e),
                    _ => Ok(Record::Raw(self.raw.to_string())),
                };
            }
        };
        match self.peek() {
            Some(b'^') => {
                self.pos += 1;
                let class_start = self.pos;
                let name = self.class_name()?;
                let class = name
                    .parse::<ResultClass>()
                    .map_err(|e| ParseError::new(class_start, e.to_string(), self.raw))?;
                let results = self.trailing_results()?;
                Ok(Record::Result(ResultRecord {
                    token,
                    class,
                    results,
                }))
            }
            Some(marker @ (b'*' | b'+' | b'=')) => {
                self.pos += 1;
                let class = self.class_name()?.to_string();
                let results = self.trailing_results()?;
                let record = AsyncRecord {
                    token,
                    class,
                    results,
                };
                Ok(match marker {
                    b'*' => Record::ExecAsync(record),
                    b'+' => Record::StatusAsync(record),
                    _ => Record::NotifyAsync(record),
                })
            }
            Some(b'-') => Ok(Record::Echo {
                token,
                command: self.rest().to_string(),
            }),
            _ => Ok(Record::Raw(self.raw.to_string())),
        }
    }

    fn class_name(&mut self) -> Result<&'a str, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b != b',') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("missing record class"));
        }
        Ok(&self.raw[start..self.pos])
    }

    /// Optional `,result,...` after a record class, running to end of line.
    fn trailing_results(&mut self) -> Result<Tuple, ParseError> {
        if self.at_end() {
            return Ok(Tuple::default());
        }
        if !self.eat(b',') {
            return Err(self.error("expected ','"));
        }
        self.results_to_end()
    }

    fn results_to_end(&mut self) -> Result<Tuple, ParseError> {
        let mut tuple = Tuple::default();
        if self.at_end() {
            return Ok(tuple);
        }
        loop {
            let result = self.result()?;
            tuple.push(result.name, result.value);
            if self.at_end() {
                return Ok(tuple);
            }
            if !self.eat(b',') {
                return Err(self.error("expected ',' or end of line"));
            }
        }
    }

    fn result(&mut self) -> Result<NamedValue, ParseError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b'=') => break,
                Some(b',' | b'{' | b'}' | b'[' | b']' | b'"') | None => {
                    return Err(self.error("expected '=' after variable name"));
                }
                Some(_) => self.pos += 1,
            }
        }
        if start == self.pos {
            return Err(self.error("missing variable name"));
        }
        let name = self.raw[start..self.pos].to_string();
        self.pos += 1;
        let value = self.result_value()?;
        Ok(NamedValue::new(name, value))
    }

    /// A value in the position of a result; accepts a list of tuples.
    fn result_value(&mut self) -> Result<Value, ParseError> {
        if self.peek() != Some(b'{') {
            return self.value();
        }
        let first = self.tuple()?;
        if !self.rest().starts_with(",{") {
            return Ok(Value::Tuple(first));
        }
        let mut tuples = vec![Value::Tuple(first)];
        while self.rest().starts_with(",{") {
            self.pos += 1;
            tuples.push(Value::Tuple(self.tuple()?));
        }
        Ok(Value::List(List::Values(tuples)))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => self.c_string().map(Value::Const),
            Some(b'{') => self.tuple().map(Value::Tuple),
            Some(b'[') => self.list().map(Value::List),
            Some(_) => Err(self.error("expected '\"', '{' or '['")),
            None => Err(self.error("expected value, found end of line")),
        }
    }

    fn tuple(&mut self) -> Result<Tuple, ParseError> {
        let open = self.pos;
        self.pos += 1;
        let mut tuple = Tuple::default();
        if self.eat(b'}') {
            return Ok(tuple);
        }
        loop {
            let result = self.result()?;
            tuple.push(result.name, result.value);
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                return Ok(tuple);
            }
            return Err(if self.at_end() {
                ParseError::new(open, "unterminated tuple", self.raw)
            } else {
                self.error("expected ',' or '}'")
            });
        }
    }

    fn list(&mut self) -> Result<List, ParseError> {
        let open = self.pos;
        self.pos += 1;
        if self.eat(b']') {
            return Ok(List::Values(Vec::new()));
        }
        let bare_values = matches!(self.peek(), Some(b'"' | b'{' | b'['));
        let mut values = Vec::new();
        let mut results = Vec::new();
        loop {
            if bare_values {
                values.push(self.value()?);
            } else {
                results.push(self.result()?);
            }
            if self.eat(b',') {
                continue;
            }
            if self.eat(b']') {
                break;
            }
            return Err(if self.at_end() {
                ParseError::new(open, "unterminated list", self.raw)
            } else {
                self.error("expected ',' or ']'")
            });
        }
        Ok(if bare_values {
            List::Values(values)
        } else {
            List::Results(results)
        })
    }

    /// Quoted C-string starting at the current position.
    fn c_string(&mut self) -> Result<String, ParseError> {
        let open = self.pos;
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let Some(byte) = self.peek() else {
                return Err(ParseError::new(open, "unterminated string", self.raw));
            };
            self.pos += 1;
            match byte {
                b'"' => {
                    // `""` inside a string stands for one quote.
                    if self.eat(b'"') {
                        out.push(b'"');
                    } else {
                        break;
                    }
                }
                b'\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(ParseError::new(open, "unterminated string", self.raw));
                    };
                    self.pos += 1;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'0'..=b'7' => out.push(self.octal(escaped)),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Up to three octal digits, the first already consumed.
    fn octal(&mut self, first: u8) -> u8 {
        let mut value = first - b'0';
        for _ in 0..2 {
            match self.peek() {
                Some(digit @ b'0'..=b'7') => {
                    // `\777` wraps like a C char.
                    value = value.wrapping_mul(8).wrapping_add(digit - b'0');
                    self.pos += 1;
                }
                _ => break,
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(line: &str) -> ResultRecord {
        match parse_record(line).unwrap() {
            Record::Result(r) => r,
            other => panic!("expected result record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tokenized_result() {
        let record = result("5^done,value=\"42\"");
        assert_eq!(record.token, Some(5));
        assert_eq!(record.class, ResultClass::Done);
        assert_eq!(record.results.find_str("value").unwrap(), "42");
        assert_eq!(record.results.len(), 1);
    }

    #[test]
    fn test_parse_result_without_results() {
        let record = result("^running");
        assert_eq!(record.token, None);
        assert_eq!(record.class, ResultClass::Running);
        assert!(record.results.is_empty());
    }

    #[test]
    fn test_error_message() {
        let record = result("7^error,msg=\"no such symbol\"");
        assert_eq!(record.error_message(), Some("no such symbol"));
        assert_eq!(result("7^done,msg=\"x\"").error_message(), None);
    }

    #[test]
    fn test_async_records() {
        match parse_record("*stopped,reason=\"breakpoint-hit\",thread-id=\"1\"").unwrap() {
            Record::ExecAsync(a) => {
                assert_eq!(a.class, "stopped");
                assert_eq!(a.results.find_str("reason").unwrap(), "breakpoint-hit");
                assert_eq!(a.results.find_u32("thread-id").unwrap(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_record("=thread-group-added,id=\"i1\"").unwrap(),
            Record::NotifyAsync(a) if a.class == "thread-group-added"
        ));
        assert!(matches!(
            parse_record("+download,section=\".text\"").unwrap(),
            Record::StatusAsync(a) if a.class == "download"
        ));
        assert!(matches!(
            parse_record("12*running,thread-id=\"all\"").unwrap(),
            Record::ExecAsync(a) if a.token == Some(12)
        ));
    }

    #[test]
    fn test_stream_records() {
        assert_eq!(
            parse_record("~\"Hello\\n\"").unwrap(),
            Record::ConsoleStream("Hello\n".to_string())
        );
        assert_eq!(
            parse_record("@\"target says hi\"").unwrap(),
            Record::TargetStream("target says hi".to_string())
        );
        assert_eq!(
            parse_record("&\"warning: x\\r\\n\"").unwrap(),
            Record::LogStream("warning: x\r\n".to_string())
        );
        assert_eq!(
            parse_record("~not quoted").unwrap(),
            Record::ConsoleStream("not quoted".to_string())
        );
    }

    #[test]
    fn test_prompt_echo_and_raw() {
        assert_eq!(parse_record("(gdb) \r\n").unwrap(), Record::Prompt);
        assert_eq!(
            parse_record("1003-break-insert main").unwrap(),
            Record::Echo {
                token: Some(1003),
                command: "-break-insert main".to_string()
            }
        );
        assert_eq!(
            parse_record("Hello from the debuggee").unwrap(),
            Record::Raw("Hello from the debuggee".to_string())
        );
        assert_eq!(
            parse_record("42 is the answer").unwrap(),
            Record::Raw("42 is the answer".to_string())
        );
    }

    #[test]
    fn test_nested_list_of_tuples() {
        let tuple = parse_result_list("a=[{x=\"1\"},{x=\"2\"}]").unwrap();
        let list = tuple.find_list("a").unwrap();
        assert_eq!(list.len(), 2);
        let xs: Vec<u32> = list.tuples().map(|t| t.find_u32("x").unwrap()).collect();
        assert_eq!(xs, vec![1, 2]);
    }

    #[test]
    fn test_named_list() {
        let tuple = parse_result_list(
            "stack=[frame={level=\"0\",func=\"main\"},frame={level=\"1\",func=\"start\"}]",
        )
        .unwrap();
        let stack = tuple.find_list("stack").unwrap();
        assert!(matches!(stack, List::Results(_)));
        assert_eq!(stack.count_of("frame"), 2);
        let funcs: Vec<&str> = stack
            .find_all("frame")
            .filter_map(Value::as_tuple)
            .map(|t| t.try_find_str("func"))
            .collect();
        assert_eq!(funcs, vec!["main", "start"]);
    }

    #[test]
    fn test_value_lists_and_empty_containers() {
        let tuple = parse_result_list("names=[\"rax\",\"rbx\"],empty=[],t={}").unwrap();
        assert_eq!(
            tuple.find_list("names").unwrap().as_strings(),
            vec!["rax", "rbx"]
        );
        assert!(tuple.find_list("empty").unwrap().is_empty());
        assert!(tuple.find_tuple("t").unwrap().is_empty());
    }

    #[test]
    fn test_multiple_location_breakpoint() {
        let record = result(
            "^done,bkpt={number=\"1\",addr=\"<MULTIPLE>\"},{number=\"1.1\",addr=\"0x4005d0\"},{number=\"1.2\",addr=\"0x4005e0\"}",
        );
        let list = record.results.find_list("bkpt").unwrap();
        assert_eq!(list.len(), 3);
        let addrs: Vec<&str> = list.tuples().map(|t| t.try_find_str("addr")).collect();
        assert_eq!(addrs, vec!["<MULTIPLE>", "0x4005d0", "0x4005e0"]);
        assert_eq!(record.results.len(), 1);
    }

    #[test]
    fn test_c_string_escapes() {
        assert_eq!(parse_c_string(r#""a\"b\\c\td""#).unwrap(), "a\"b\\c\td");
        assert_eq!(parse_c_string(r#""caf\303\251""#).unwrap(), "café");
        assert_eq!(parse_c_string(r#""\101\0""#).unwrap(), "A\0");
        assert_eq!(parse_c_string(r#""say ""hi""""#).unwrap(), "say \"hi\"");
        assert_eq!(parse_c_string(r#""\q""#).unwrap(), "q");
        assert_eq!(parse_c_string("bare text").unwrap(), "bare text");
    }

    #[test]
    fn test_unterminated_string_reports_opening_offset() {
        let err = parse_record("^done,value=\"abc").unwrap_err();
        assert_eq!(err.offset, 12);
        assert_eq!(err.raw, "^done,value=\"abc");
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn test_unmatched_delimiters() {
        let err = parse_result_list("a={b=\"1\"").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.message.contains("unterminated tuple"));

        let err = parse_result_list("a=[\"1\",\"2\"").unwrap_err();
        assert!(err.message.contains("unterminated list"));

        let err = parse_result_list("a={b=\"1\"]").unwrap_err();
        assert_eq!(err.offset, 8);
    }

    #[test]
    fn test_malformed_results() {
        assert!(parse_result_list("a").is_err());
        assert!(parse_result_list("=\"1\"").is_err());
        assert!(parse_result_list("a=1").is_err());
        assert!(parse_result_list("a=\"1\"b=\"2\"").is_err());
        assert!(parse_c_string("\"done\" extra").is_err());
        let err = parse_record("^finished").unwrap_err();
        assert_eq!(err.offset, 1);
        assert!(parse_record("*").is_err());
    }

    #[test]
    fn test_duplicate_names_resolve_to_first() {
        let tuple = parse_result_list("thread-id=\"1\",thread-id=\"2\"").unwrap();
        assert_eq!(tuple.find_u32("thread-id").unwrap(), 1);
        assert_eq!(tuple.count_of("thread-id"), 2);
    }
}
