//! Tokenizer with Python-style indentation tracking.

use crate::error::ProgramError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    /// String literal. F-strings keep their raw body; the parser splits
    /// them into literal text and replacement fields.
    Str {
        value: String,
        fstring: bool,
        raw: bool,
    },
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub column: usize,
}

const OPS3: [&str; 5] = ["**=", "//=", "...", ">>=", "<<="];
const OPS2: [&str; 19] = [
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", ":=", "<<", ">>", "&=", "|=", "^=",
    "@=",
];
const OPS1: [&str; 23] = [
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "|", "&", "^",
    "~",
];

/// Tokenizes `source`, numbering lines from 1.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ProgramError> {
    tokenize_at(source, 1)
}

/// Tokenizes `source`, numbering lines from `first_line`.
pub fn tokenize_at(source: &str, first_line: usize) -> Result<Vec<Token>, ProgramError> {
    Lexer::new(source, first_line).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    line_start: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str, first_line: usize) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: first_line,
            line_start: 0,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn column(&self) -> usize {
        self.pos.saturating_sub(self.line_start) + 1
    }

    fn error(&self, message: impl Into<String>) -> ProgramError {
        ProgramError::compile(self.line, self.column(), message)
    }

    fn push(&mut self, tok: Tok, line: usize, column: usize) {
        self.tokens.push(Token { tok, line, column });
    }

    fn newline(&mut self) {
        self.line += 1;
        self.line_start = self.pos;
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline | Tok::Indent | Tok::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>, ProgramError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
                continue;
            }
            let Some(c) = self.peek(0) else { break };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    if self.depth == 0 && !self.last_is_newline() {
                        let (line, column) = (self.line, self.column());
                        self.push(Tok::Newline, line, column);
                    }
                    self.pos += 1;
                    self.newline();
                    if self.depth == 0 {
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.newline();
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.newline();
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.name_or_prefixed_string()?,
                '"' | '\'' => {
                    let (line, column) = (self.line, self.column());
                    let tok = self.string(false, false)?;
                    self.push(tok, line, column);
                }
                _ => self.operator()?,
            }
        }

        let (line, column) = (self.line, self.column());
        if !self.last_is_newline() {
            self.push(Tok::Newline, line, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, line, column);
        }
        self.push(Tok::Eof, line, column);
        Ok(self.tokens)
    }

    fn skip_comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    /// Measures indentation at the start of a logical line and emits
    /// INDENT/DEDENT tokens. Returns false at end of input.
    fn indentation(&mut self) -> Result<bool, ProgramError> {
        let mut width = 0usize;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width += 8 - width % 8,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.newline();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            Some(_) => {}
        }

        self.at_line_start = false;
        let (line, column) = (self.line, self.column());
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, line, column);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent, line, column);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn number(&mut self) -> Result<(), ProgramError> {
        let (line, column) = (self.line, self.column());
        let start = self.pos;

        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            let radix = match self.peek(1) {
                Some('x' | 'X') => 16,
                Some('o' | 'O') => 8,
                _ => 2,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek(0).is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos].iter().filter(|c| **c != '_').collect();
            let value = i64::from_str_radix(&digits, radix).map_err(|_| self.error("invalid integer literal"))?;
            self.push(Tok::Int(value), line, column);
            return Ok(());
        }

        let mut is_float = false;
        self.digits();
        if self.peek(0) == Some('.') && self.peek(1) != Some('.') {
            is_float = true;
            self.pos += 1;
            self.digits();
        }
        if matches!(self.peek(0), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek(1), Some('+' | '-')));
            if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += 1 + sign;
                self.digits();
            }
        }

        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        let tok = if is_float {
            Tok::Float(text.parse().map_err(|_| self.error("invalid float literal"))?)
        } else {
            Tok::Int(text.parse().map_err(|_| self.error("integer literal too large"))?)
        };
        self.push(tok, line, column);
        Ok(())
    }

    fn digits(&mut self) {
        while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), ProgramError> {
        let (line, column) = (self.line, self.column());
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(0), Some('"' | '\'')) {
            let prefix = name.to_ascii_lowercase();
            if matches!(prefix.as_str(), "r" | "u" | "b" | "f" | "rb" | "br" | "fr" | "rf") {
                let tok = self.string(prefix.contains('f'), prefix.contains('r'))?;
                self.push(tok, line, column);
                return Ok(());
            }
        }
        self.push(Tok::Name(name), line, column);
        Ok(())
    }

    fn string(&mut self, fstring: bool, raw: bool) -> Result<Tok, ProgramError> {
        let Some(quote) = self.peek(0) else {
            return Err(self.error("expected string literal"));
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let (start_line, start_column) = (self.line, self.column());
        self.pos += if triple { 3 } else { 1 };

        let mut body = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(ProgramError::compile(start_line, start_column, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(ProgramError::compile(start_line, start_column, "unterminated string literal"));
                }
                body.push(c);
                self.pos += 1;
                self.newline();
                continue;
            }
            if c == '\\' {
                if let Some(next) = self.peek(1) {
                    body.push(c);
                    body.push(next);
                    self.pos += 2;
                    if next == '\n' {
                        self.newline();
                    }
                    continue;
                }
            }
            body.push(c);
            self.pos += 1;
        }

        let value = if fstring || raw { body } else { unescape(&body) };
        Ok(Tok::Str { value, fstring, raw })
    }

    fn operator(&mut self) -> Result<(), ProgramError> {
        let (line, column) = (self.line, self.column());
        let rest: String = self.chars[self.pos..(self.pos + 3).min(self.chars.len())].iter().collect();
        let op = OPS3
            .iter()
            .chain(OPS2.iter())
            .chain(OPS1.iter())
            .find(|op| rest.starts_with(**op))
            .copied()
            .ok_or_else(|| self.error(format!("invalid character '{}'", rest.chars().next().unwrap_or(' '))))?;

        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.chars().count();
        self.push(Tok::Op(op), line, column);
        Ok(())
    }
}

/// Processes backslash escapes. Unknown escapes keep the backslash.
#[must_use]
pub fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' | '\'' | '"' => out.push(next),
            '\n' => {}
            'x' | 'u' | 'U' => {
                let len = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..len).filter_map(|_| chars.next_if(char::is_ascii_hexdigit)).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if hex.len() == len => out.push(decoded),
                    _ => {
                        out.push('\\');
                        out.push(next);
                        out.push_str(&hex);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\n\n    # note\nz\n");
        assert_eq!(
            toks,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn brackets_join_lines() {
        let toks = kinds("x = [1,\n     2]\n");
        assert!(!toks[..toks.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn strings_and_prefixes() {
        let toks = kinds(r#"a = 'it\'s' + f"{x}!" + r'\d' + """two
lines""""#);
        assert!(toks.contains(&Tok::Str { value: "it's".into(), fstring: false, raw: false }));
        assert!(toks.contains(&Tok::Str { value: "{x}!".into(), fstring: true, raw: false }));
        assert!(toks.contains(&Tok::Str { value: "\\d".into(), fstring: false, raw: true }));
        assert!(toks.contains(&Tok::Str { value: "two\nlines".into(), fstring: false, raw: false }));
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1_000 0x1f 2.5 1e3 .5")[..5], [
            Tok::Int(1000),
            Tok::Int(31),
            Tok::Float(2.5),
            Tok::Float(1000.0),
            Tok::Float(0.5),
        ]);
    }

    #[test]
    fn bad_dedent_is_reported_with_position() {
        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        match err {
            ProgramError::Compile { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unterminated_string() {
        assert!(tokenize("x = 'abc\n").is_err());
    }

    #[test]
    fn unescape_handles_common_sequences() {
        assert_eq!(unescape(r"a\nb\t\x41\u00e9\q"), "a\nb\tA\u{e9}\\q");
    }
}
