// File: src/lexer.rs
//
// Tokenizer for Hemlock source. Produces a flat token stream; string
// interpolation is split into literal parts and raw expression sources here,
// and the parser runs a sub-parser over each expression source.

use crate::errors::HemlockError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    /// `string_parts.len() == expr_sources.len() + 1`.
    InterpStr { string_parts: Vec<String>, expr_sources: Vec<String> },
    Rune(char),
    Identifier(String),
    Keyword(String),
    /// Operators and punctuation, longest-match first.
    Sym(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

const KEYWORDS: &[&str] = &[
    "let", "const", "fn", "return", "if", "else", "while", "for", "in", "switch", "case",
    "default", "break", "continue", "try", "catch", "finally", "throw", "defer", "enum", "async",
    "await", "true", "false", "null", "self", "typeof", "as",
];

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, HemlockError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        match c {
            Some('\n') => {
                self.line += 1;
                self.column = 1;
            }
            Some(_) => self.column += 1,
            None => {}
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn push(&mut self, kind: TokenKind, line: u32, column: u32) {
        self.tokens.push(Token { kind, line, column });
    }

    fn error(&self, message: impl Into<String>) -> HemlockError {
        HemlockError::parse(message, self.line, self.column)
    }

    fn run(&mut self) -> Result<(), HemlockError> {
        while let Some(c) = self.peek() {
            let line = self.line;
            let column = self.column;
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.bump();
                }
                '/' => {
                    self.bump();
                    match self.peek() {
                        Some('/') => {
                            while let Some(ch) = self.bump() {
                                if ch == '\n' {
                                    break;
                                }
                            }
                        }
                        Some('*') => {
                            self.bump();
                            self.skip_block_comment()?;
                        }
                        Some('=') => {
                            self.bump();
                            self.push(TokenKind::Sym("/=".into()), line, column);
                        }
                        _ => self.push(TokenKind::Sym("/".into()), line, column),
                    }
                }
                '"' => {
                    self.bump();
                    self.lex_string(line, column)?;
                }
                '\'' => {
                    self.bump();
                    self.lex_rune(line, column)?;
                }
                '0'..='9' => {
                    self.lex_number(line, column)?;
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(ch) = self.peek() {
                        if ch.is_alphanumeric() || ch == '_' {
                            ident.push(ch);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    let kind = if KEYWORDS.contains(&ident.as_str()) {
                        TokenKind::Keyword(ident)
                    } else {
                        TokenKind::Identifier(ident)
                    };
                    self.push(kind, line, column);
                }
                _ => {
                    let sym = self.lex_symbol()?;
                    self.push(TokenKind::Sym(sym), line, column);
                }
            }
        }
        let line = self.line;
        let column = self.column;
        self.push(TokenKind::Eof, line, column);
        Ok(())
    }

    fn skip_block_comment(&mut self) -> Result<(), HemlockError> {
        let mut depth = 1;
        while depth > 0 {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    depth -= 1;
                }
                Some('/') if self.peek() == Some('*') => {
                    self.bump();
                    depth += 1;
                }
                Some(_) => {}
                None => return Err(self.error("Unterminated block comment")),
            }
        }
        Ok(())
    }

    fn lex_escape(&mut self) -> Result<char, HemlockError> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some('$') => Ok('$'),
            Some('u') => {
                if self.bump() != Some('{') {
                    return Err(self.error("Expected '{' after \\u"));
                }
                let mut hex = String::new();
                loop {
                    match self.bump() {
                        Some('}') => break,
                        Some(ch) if ch.is_ascii_hexdigit() => hex.push(ch),
                        _ => return Err(self.error("Invalid \\u{...} escape")),
                    }
                }
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| self.error("Invalid \\u{...} escape"))?;
                char::from_u32(code).ok_or_else(|| self.error("Invalid unicode codepoint"))
            }
            Some(other) => Ok(other),
            None => Err(self.error("Unterminated escape sequence")),
        }
    }

    fn lex_string(&mut self, line: u32, column: u32) -> Result<(), HemlockError> {
        let mut string_parts = vec![String::new()];
        let mut expr_sources = Vec::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => {
                    let ch = self.lex_escape()?;
                    string_parts.last_mut().unwrap().push(ch);
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    expr_sources.push(self.lex_interp_expr()?);
                    string_parts.push(String::new());
                }
                Some(ch) => string_parts.last_mut().unwrap().push(ch),
                None => return Err(self.error("Unterminated string literal")),
            }
        }
        let kind = if expr_sources.is_empty() {
            TokenKind::Str(string_parts.pop().unwrap())
        } else {
            TokenKind::InterpStr { string_parts, expr_sources }
        };
        self.push(kind, line, column);
        Ok(())
    }

    /// Collect the raw source of a `${...}` expression, tracking brace depth
    /// and nested string literals.
    fn lex_interp_expr(&mut self) -> Result<String, HemlockError> {
        let mut source = String::new();
        let mut depth = 1;
        loop {
            match self.bump() {
                Some('{') => {
                    depth += 1;
                    source.push('{');
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(source);
                    }
                    source.push('}');
                }
                Some('"') => {
                    source.push('"');
                    loop {
                        match self.bump() {
                            Some('\\') => {
                                source.push('\\');
                                if let Some(ch) = self.bump() {
                                    source.push(ch);
                                }
                            }
                            Some('"') => {
                                source.push('"');
                                break;
                            }
                            Some(ch) => source.push(ch),
                            None => return Err(self.error("Unterminated string literal")),
                        }
                    }
                }
                Some(ch) => source.push(ch),
                None => return Err(self.error("Unterminated interpolation expression")),
            }
        }
    }

    fn lex_rune(&mut self, line: u32, column: u32) -> Result<(), HemlockError> {
        let value = match self.bump() {
            Some('\\') => self.lex_escape()?,
            Some('\'') => return Err(self.error("Empty rune literal")),
            Some(ch) => ch,
            None => return Err(self.error("Unterminated rune literal")),
        };
        if self.bump() != Some('\'') {
            return Err(self.error("Rune literal must contain exactly one character"));
        }
        self.push(TokenKind::Rune(value), line, column);
        Ok(())
    }

    fn lex_number(&mut self, line: u32, column: u32) -> Result<(), HemlockError> {
        let mut text = String::new();
        let first = self.bump().unwrap();
        text.push(first);

        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.bump();
            let mut hex = String::new();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_hexdigit() || ch == '_' {
                    if ch != '_' {
                        hex.push(ch);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            if hex.is_empty() {
                return Err(self.error("Hex literal needs at least one digit"));
            }
            let value = i64::from_str_radix(&hex, 16)
                .or_else(|_| u64::from_str_radix(&hex, 16).map(|v| v as i64))
                .map_err(|_| self.error("Hex literal out of range"))?;
            self.push(TokenKind::Int(value), line, column);
            return Ok(());
        }

        let mut is_float = false;
        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' | '_' => {
                    if ch != '_' {
                        text.push(ch);
                    }
                    self.bump();
                }
                '.' => {
                    // `1.method()` is a property access, not a float
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            is_float = true;
                            text.push('.');
                            self.bump();
                        }
                        _ => break,
                    }
                }
                'e' | 'E' => {
                    is_float = true;
                    text.push(ch);
                    self.bump();
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        text.push(self.bump().unwrap());
                    }
                }
                _ => break,
            }
        }

        if is_float {
            let value: f64 =
                text.parse().map_err(|_| self.error("Malformed float literal"))?;
            self.push(TokenKind::Float(value), line, column);
        } else {
            let value: i64 =
                text.parse().map_err(|_| self.error("Integer literal out of range"))?;
            self.push(TokenKind::Int(value), line, column);
        }
        Ok(())
    }

    fn lex_symbol(&mut self) -> Result<String, HemlockError> {
        let first = self.bump().unwrap();
        let second = self.peek();
        let two = |b: char| -> String { [first, b].iter().collect() };
        let sym = match (first, second) {
            ('?', Some('?')) => {
                self.bump();
                "??".to_string()
            }
            ('?', Some('.')) => {
                self.bump();
                "?.".to_string()
            }
            ('=', Some('=')) | ('!', Some('=')) | ('<', Some('=')) | ('>', Some('=')) => {
                let b = self.bump().unwrap();
                two(b)
            }
            ('&', Some('&')) | ('|', Some('|')) | ('+', Some('+')) | ('-', Some('-')) => {
                let b = self.bump().unwrap();
                two(b)
            }
            ('+', Some('=')) | ('-', Some('=')) | ('*', Some('=')) | ('%', Some('=')) => {
                let b = self.bump().unwrap();
                two(b)
            }
            ('<', Some('<')) | ('>', Some('>')) => {
                let b = self.bump().unwrap();
                two(b)
            }
            ('-', Some('>')) => {
                self.bump();
                "->".to_string()
            }
            ('.', Some('.')) => {
                self.bump();
                if self.peek() == Some('.') {
                    self.bump();
                    "...".to_string()
                } else {
                    return Err(self.error("Unexpected '..'"));
                }
            }
            (c, _) if "+-*/%=<>!&|^~?:.,;()[]{}".contains(c) => c.to_string(),
            (c, _) => return Err(self.error(format!("Unexpected character '{}'", c))),
        };
        Ok(sym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_split_ints_and_floats() {
        assert_eq!(
            kinds("42 3.5 0xff 1e3"),
            vec![
                TokenKind::Int(42),
                TokenKind::Float(3.5),
                TokenKind::Int(255),
                TokenKind::Float(1000.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn method_call_on_int_is_not_a_float() {
        let toks = kinds("1.to_upper");
        assert_eq!(toks[0], TokenKind::Int(1));
        assert_eq!(toks[1], TokenKind::Sym(".".into()));
    }

    #[test]
    fn interpolated_string_splits_parts() {
        let toks = kinds(r#""a ${x + 1} b""#);
        match &toks[0] {
            TokenKind::InterpStr { string_parts, expr_sources } => {
                assert_eq!(string_parts, &vec!["a ".to_string(), " b".to_string()]);
                assert_eq!(expr_sources, &vec!["x + 1".to_string()]);
            }
            other => panic!("expected interp string, got {:?}", other),
        }
    }

    #[test]
    fn interpolation_tracks_nested_braces_and_strings() {
        let toks = kinds(r#""v: ${ {a: "}"} }""#);
        match &toks[0] {
            TokenKind::InterpStr { expr_sources, .. } => {
                assert_eq!(expr_sources[0], r#" {a: "}"} "#);
            }
            other => panic!("expected interp string, got {:?}", other),
        }
    }

    #[test]
    fn rune_literals_and_escapes() {
        assert_eq!(kinds("'a'")[0], TokenKind::Rune('a'));
        assert_eq!(kinds(r"'\n'")[0], TokenKind::Rune('\n'));
        assert_eq!(kinds(r"'\u{1F600}'")[0], TokenKind::Rune('\u{1F600}'));
    }

    #[test]
    fn optional_chain_and_coalesce_symbols() {
        let syms: Vec<TokenKind> = kinds("a?.b ?? c")
            .into_iter()
            .filter(|k| matches!(k, TokenKind::Sym(_)))
            .collect();
        assert_eq!(syms, vec![TokenKind::Sym("?.".into()), TokenKind::Sym("??".into())]);
    }

    #[test]
    fn keywords_are_separated_from_identifiers() {
        let toks = kinds("let letter");
        assert_eq!(toks[0], TokenKind::Keyword("let".into()));
        assert_eq!(toks[1], TokenKind::Identifier("letter".into()));
    }
}
