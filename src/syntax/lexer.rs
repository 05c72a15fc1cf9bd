//! Byte-oriented character lexer (spec.md §6 surface: keywords, idents
//! with optional `:` separators, atoms `#name`, string escapes, numeric
//! literals, `'(` list-literal opener).

use crate::ast::Span;
use crate::syntax::token::{Token, TokenKind, lookup_keyword};

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

#[derive(Clone, Copy)]
struct Pos {
    offset: u32,
    line: u32,
    col: u32,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            out.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(out)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn here(&self) -> Pos {
        Pos {
            offset: self.pos as u32,
            line: self.line,
            col: self.col,
        }
    }

    fn span(&self, start: Pos) -> Span {
        Span::new(start.offset, self.pos as u32, start.line, start.col)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'#') if self.peek_at(1) == Some(b'#') => {
                    // `##` line comment; `#name` elsewhere is an atom literal.
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let start = self.here();
        let Some(b) = self.peek() else {
            return Ok(Token::new(TokenKind::Eof, self.span(start)));
        };

        if b.is_ascii_digit() {
            return self.lex_number(start);
        }
        if b == b'"' {
            return self.lex_string(start);
        }
        if b == b'#' {
            return self.lex_atom(start);
        }
        if is_ident_start(b) {
            return self.lex_ident(start);
        }

        self.advance();
        let kind = match b {
            b'\'' if self.peek() == Some(b'(') => {
                self.advance();
                TokenKind::Quote
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'^' => TokenKind::Caret,
            b'%' => TokenKind::Percent,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semi,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b'$' => TokenKind::Dollar,
            b'&' if self.peek() == Some(b'&') => {
                self.advance();
                TokenKind::AndAnd
            }
            b'|' if self.peek() == Some(b'|') => {
                self.advance();
                TokenKind::OrOr
            }
            b'=' if self.peek() == Some(b'=') => {
                self.advance();
                TokenKind::EqEq
            }
            b'=' if self.peek() == Some(b'>') => {
                self.advance();
                TokenKind::Arrow
            }
            b'=' => TokenKind::Eq,
            b'!' if self.peek() == Some(b'=') => {
                self.advance();
                TokenKind::BangEq
            }
            b'!' => TokenKind::Bang,
            b'<' if self.peek() == Some(b'=') => {
                self.advance();
                TokenKind::Lte
            }
            b'<' => TokenKind::Lt,
            b'>' if self.peek() == Some(b'=') => {
                self.advance();
                TokenKind::Gte
            }
            b'>' => TokenKind::Gt,
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{}'", other as char),
                    line: start.line,
                    col: start.col,
                });
            }
        };
        Ok(Token::new(kind, self.span(start)))
    }

    fn lex_number(&mut self, start: Pos) -> Result<Token, LexError> {
        let begin = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.advance();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap();
        let kind = if is_float {
            TokenKind::Float(text.parse().map_err(|_| LexError {
                message: format!("malformed float literal '{text}'"),
                line: start.line,
                col: start.col,
            })?)
        } else {
            TokenKind::Integer(text.parse().map_err(|_| LexError {
                message: format!("malformed integer literal '{text}'"),
                line: start.line,
                col: start.col,
            })?)
        };
        Ok(Token::new(kind, self.span(start)))
    }

    fn lex_string(&mut self, start: Pos) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".into(),
                        line: start.line,
                        col: start.col,
                    });
                }
                Some(b'"') => break,
                Some(b'\\') => {
                    let esc = self.advance().ok_or_else(|| LexError {
                        message: "unterminated escape sequence".into(),
                        line: start.line,
                        col: start.col,
                    })?;
                    s.push(match esc {
                        b'n' => '\n',
                        b't' => '\t',
                        b'"' => '"',
                        b'\\' => '\\',
                        b'0' => '\0',
                        other => {
                            return Err(LexError {
                                message: format!("unknown escape '\\{}'", other as char),
                                line: start.line,
                                col: start.col,
                            });
                        }
                    });
                }
                Some(b) => s.push(b as char),
            }
        }
        Ok(Token::new(TokenKind::Str(s), self.span(start)))
    }

    fn lex_atom(&mut self, start: Pos) -> Result<Token, LexError> {
        self.advance(); // '#'
        let begin = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        let name = std::str::from_utf8(&self.src[begin..self.pos]).unwrap().to_string();
        if name.is_empty() {
            return Err(LexError {
                message: "empty atom literal".into(),
                line: start.line,
                col: start.col,
            });
        }
        Ok(Token::new(TokenKind::Atom(name), self.span(start)))
    }

    fn lex_ident(&mut self, start: Pos) -> Result<Token, LexError> {
        let begin = self.pos;
        while self
            .peek()
            .is_some_and(|b| is_ident_continue(b) || (b == b':' && self.peek_at(1).is_some_and(is_ident_continue)))
        {
            self.advance();
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap().to_string();
        let kind = lookup_keyword(&text).unwrap_or(TokenKind::Ident(text));
        Ok(Token::new(kind, self.span(start)))
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_arithmetic_expression() {
        assert_eq!(
            kinds("1 + 2 * 3;"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Plus,
                TokenKind::Integer(2),
                TokenKind::Star,
                TokenKind::Integer(3),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_qualified_identifier() {
        assert_eq!(kinds("A:f"), vec![TokenKind::Ident("A:f".into()), TokenKind::Eof]);
    }

    #[test]
    fn lexes_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![TokenKind::Str("a\nb".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn lexes_atom_and_quote() {
        assert_eq!(
            kinds("#ok '(1 2)"),
            vec![
                TokenKind::Atom("ok".into()),
                TokenKind::Quote,
                TokenKind::Integer(1),
                TokenKind::Integer(2),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }
}
