//! Tokenizer for module expressions.
//!
//! Offsets are byte positions into the source and always fall on a char boundary, so the parser
//! and compiler can slice the source with them when reporting errors.

use std::{fmt, iter::Peekable, str::CharIndices};

use crate::expression::error::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Punct {
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    And,
    Or,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Question,
    Colon,
}

impl Punct {
    /// Two-character operators, matched before any single character.
    const PAIRS: [(&'static str, Punct); 6] = [
        ("&&", Punct::And),
        ("||", Punct::Or),
        ("==", Punct::Eq),
        ("!=", Punct::NotEq),
        ("<=", Punct::LessEq),
        (">=", Punct::GreaterEq),
    ];

    fn single(c: char) -> Option<Self> {
        Some(match c {
            '(' => Self::LParen,
            ')' => Self::RParen,
            ',' => Self::Comma,
            '+' => Self::Plus,
            '-' => Self::Minus,
            '*' => Self::Star,
            '/' => Self::Slash,
            '%' => Self::Percent,
            '!' => Self::Not,
            '<' => Self::Less,
            '>' => Self::Greater,
            '?' => Self::Question,
            ':' => Self::Colon,
            _ => return None,
        })
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Comma => ",",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Not => "!",
            Self::And => "&&",
            Self::Or => "||",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Less => "<",
            Self::LessEq => "<=",
            Self::Greater => ">",
            Self::GreaterEq => ">=",
            Self::Question => "?",
            Self::Colon => ":",
        }
    }
}

impl fmt::Display for Punct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Ident(String),
    Bool(bool),
    Punct(Punct),
    End,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "number {v}"),
            Self::Ident(name) => write!(f, "identifier '{name}'"),
            Self::Bool(b) => write!(f, "'{b}'"),
            Self::Punct(p) => write!(f, "'{p}'"),
            Self::End => f.write_str("end of expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) offset: usize,
}

struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Lexer<'_> {
    fn pos(&mut self) -> usize {
        self.chars.peek().map_or(self.src.len(), |&(i, _)| i)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_while(&mut self, pred: impl Fn(char) -> bool) {
        while self.chars.next_if(|&(_, c)| pred(c)).is_some() {}
    }

    fn next_token(&mut self) -> Result<Option<Token>, ExprError> {
        self.skip_while(char::is_whitespace);
        let Some(&(start, c)) = self.chars.peek() else {
            return Ok(None);
        };
        let src = self.src;

        let starts_fraction = c == '.' && src[start + 1..].starts_with(|d: char| d.is_ascii_digit());
        let kind = if c.is_ascii_digit() || starts_fraction {
            self.number(start)?
        } else if c.is_ascii_alphabetic() || c == '_' {
            self.skip_while(|c| c.is_ascii_alphanumeric() || c == '_');
            let end = self.pos();
            match &src[start..end] {
                "true" => TokenKind::Bool(true),
                "false" => TokenKind::Bool(false),
                word => TokenKind::Ident(word.to_owned()),
            }
        } else {
            TokenKind::Punct(self.punct(start, c)?)
        };
        Ok(Some(Token {
            kind,
            offset: start,
        }))
    }

    /// `digits [. digits] [(e|E) [+|-] digits]`, or a leading `.` followed by digits.
    fn number(&mut self, start: usize) -> Result<TokenKind, ExprError> {
        self.skip_while(|c| c.is_ascii_digit());
        if self.peek_char() == Some('.') {
            self.chars.next();
            self.skip_while(|c| c.is_ascii_digit());
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            let exponent_at = self.pos();
            self.chars.next();
            self.chars.next_if(|&(_, c)| c == '+' || c == '-');
            let digits_at = self.pos();
            self.skip_while(|c| c.is_ascii_digit());
            if self.pos() == digits_at {
                return Err(ExprError::new(exponent_at, "exponent has no digits"));
            }
        }
        let end = self.pos();
        let text = &self.src[start..end];
        text.parse()
            .map(TokenKind::Number)
            .map_err(|_| ExprError::new(start, format!("malformed number '{text}'")))
    }

    fn punct(&mut self, start: usize, c: char) -> Result<Punct, ExprError> {
        let rest = &self.src[start..];
        if let Some(&(_, pair)) = Punct::PAIRS.iter().find(|(text, _)| rest.starts_with(text)) {
            self.chars.next();
            self.chars.next();
            return Ok(pair);
        }
        let punct = Punct::single(c)
            .ok_or_else(|| ExprError::new(start, format!("unexpected character '{c}'")))?;
        self.chars.next();
        Ok(punct)
    }
}

/// Split `src` into tokens, terminated by a single [`TokenKind::End`].
pub(crate) fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut lexer = Lexer {
        src,
        chars: src.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    tokens.push(Token {
        kind: TokenKind::End,
        offset: src.len(),
    });
    Ok(tokens)
}
