//! Ent lexer - turns preprocessed source into positioned tokens

use std::fmt;

use crate::token::{Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    errors: Vec<LexError>,
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for LexError {}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            errors: Vec::new(),
        }
    }

    /// Recoverable errors collected while scanning (unknown characters).
    /// The offending characters yield no token.
    pub fn errors(&self) -> &[LexError] {
        &self.errors
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.input.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error_at(&self, line: usize, col: usize, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line,
            col,
        }
    }

    fn skip_whitespace(&mut self) -> Result<(), LexError> {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_whitespace() {
                self.advance();
            } else if ch == b'/' && self.peek_next() == Some(b'/') {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch == b'/' && self.peek_next() == Some(b'*') {
                let (line, col) = (self.line, self.col);
                self.advance();
                self.advance();
                loop {
                    match self.peek() {
                        Some(b'*') if self.peek_next() == Some(b'/') => {
                            self.advance();
                            self.advance();
                            break;
                        }
                        Some(_) => {
                            self.advance();
                        }
                        None => {
                            return Err(self.error_at(line, col, "unterminated block comment"));
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.pos;
        let (line, col) = (self.line, self.col);
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        match TokenKind::keyword(&text) {
            Some(kind) => Token::new(kind, text, line, col),
            None => Token::new(TokenKind::Identifier, text, line, col),
        }
    }

    fn read_number(&mut self) -> Token {
        let start = self.pos;
        let (line, col) = (self.line, self.col);
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        Token::new(TokenKind::Number, text, line, col)
    }

    /// Strings carry their inner text; no escape processing. The recorded
    /// position is the first character inside the quotes.
    fn read_string(&mut self) -> Result<Token, LexError> {
        let open = (self.line, self.col);
        self.advance(); // opening "
        let (line, col) = (self.line, self.col);
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b'"') => break,
                Some(_) => {
                    self.advance();
                }
                None => return Err(self.error_at(open.0, open.1, "unterminated string")),
            }
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        self.advance(); // closing "
        Ok(Token::new(TokenKind::Str, text, line, col))
    }

    fn two_char(&mut self, second: u8, double: TokenKind, single: TokenKind) -> TokenKind {
        if self.peek() == Some(second) {
            self.advance();
            double
        } else {
            single
        }
    }

    /// Tokenize the whole input. The returned sequence always ends with
    /// `Eof`. Unknown characters are reported through `errors()` and
    /// skipped; unterminated constructs abort with `Err`.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace()?;

            let ch = match self.peek() {
                Some(c) => c,
                None => break,
            };

            if ch.is_ascii_digit() {
                tokens.push(self.read_number());
                continue;
            }
            if ch.is_ascii_alphabetic() || ch == b'_' {
                tokens.push(self.read_identifier());
                continue;
            }
            if ch == b'"' {
                tokens.push(self.read_string()?);
                continue;
            }

            let (line, col) = (self.line, self.col);
            self.advance();
            let kind = match ch {
                b'(' => TokenKind::LParen,
                b')' => TokenKind::RParen,
                b'{' => TokenKind::LBrace,
                b'}' => TokenKind::RBrace,
                b'[' => TokenKind::LBracket,
                b']' => TokenKind::RBracket,
                b';' => TokenKind::Semicolon,
                b',' => TokenKind::Comma,
                b'=' => self.two_char(b'=', TokenKind::Equal, TokenKind::Assign),
                b'!' => self.two_char(b'=', TokenKind::NotEqual, TokenKind::Bang),
                b'<' => self.two_char(b'=', TokenKind::LessEqual, TokenKind::Less),
                b'>' => self.two_char(b'=', TokenKind::GreaterEqual, TokenKind::Greater),
                b'+' => TokenKind::Plus,
                b'-' => TokenKind::Minus,
                b'*' => TokenKind::Star,
                b'/' => TokenKind::Slash,
                b'%' => TokenKind::Percent,
                b'&' => TokenKind::Ampersand,
                b'|' => TokenKind::Pipe,
                _ => {
                    self.errors.push(self.error_at(
                        line,
                        col,
                        format!("unexpected character: {}", ch as char),
                    ));
                    continue;
                }
            };
            let lexeme = token_text(kind);
            tokens.push(Token::new(kind, lexeme, line, col));
        }

        tokens.push(Token::eof(self.line, self.col));
        Ok(tokens)
    }
}

fn token_text(kind: TokenKind) -> &'static str {
    match kind {
        TokenKind::LParen => "(",
        TokenKind::RParen => ")",
        TokenKind::LBrace => "{",
        TokenKind::RBrace => "}",
        TokenKind::LBracket => "[",
        TokenKind::RBracket => "]",
        TokenKind::Semicolon => ";",
        TokenKind::Comma => ",",
        TokenKind::Assign => "=",
        TokenKind::Equal => "==",
        TokenKind::NotEqual => "!=",
        TokenKind::Less => "<",
        TokenKind::LessEqual => "<=",
        TokenKind::Greater => ">",
        TokenKind::GreaterEqual => ">=",
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Star => "*",
        TokenKind::Slash => "/",
        TokenKind::Percent => "%",
        TokenKind::Ampersand => "&",
        TokenKind::Pipe => "|",
        TokenKind::Bang => "!",
        _ => "",
    }
}
