//! The scanner that produces tokens from source text.
//!
//! The scanner owns the include stack: an `include<…>` directive suspends the
//! current stream and lexes the included file in place, while `use<…>` only
//! records the dependency on the active translation unit. Neither directive
//! ever surfaces as a token.

use std::collections::BTreeSet;
use std::rc::Rc;

use unicode_segmentation::UnicodeSegmentation;

use super::{FileHandle, Location, Token, TokenKind};
use crate::diag::SyntaxError;
use crate::frontend::Sources;

/// One entry of the include stack.
struct Stream {
    text: String,
    pos: usize,
}

impl Stream {
    fn rest(&self) -> &str {
        &self.text[self.pos..]
    }
}

/// A scanner that tokenizes modelling-language source code.
///
/// `use<…>` targets are collected on the scanner itself; the parser merges
/// them into the translation unit once the file is fully consumed.
pub struct Scanner<'a> {
    sources: &'a mut dyn Sources,
    streams: Vec<Stream>,
    loc: Location,
    scratch: String,
    uses: BTreeSet<FileHandle>,
}

impl<'a> Scanner<'a> {
    /// Creates a scanner for `file`, opening it through `sources`.
    pub fn new(sources: &'a mut dyn Sources, file: FileHandle) -> Result<Self, SyntaxError> {
        let loc = Location::start_of(file, None);
        let text = sources
            .open(file)
            .map_err(|e| SyntaxError::new(loc.clone(), e.to_string()))?;
        Ok(Self {
            sources,
            streams: vec![Stream { text, pos: 0 }],
            loc,
            scratch: String::new(),
            uses: BTreeSet::new(),
        })
    }

    /// The `use<…>` dependencies seen so far.
    pub fn uses(&self) -> &BTreeSet<FileHandle> {
        &self.uses
    }

    /// Consumes the scanner, yielding the recorded `use<…>` dependencies.
    pub fn into_uses(self) -> BTreeSet<FileHandle> {
        self.uses
    }

    /// Returns the next token from the source.
    pub fn next_token(&mut self) -> Result<Token, SyntaxError> {
        loop {
            self.skip_whitespace_and_comments();
            self.loc.step();

            let Some(ch) = self.peek() else {
                if self.pop_stream() {
                    continue;
                }
                return Ok(Token::new(TokenKind::Eof, self.loc.clone()));
            };

            let kind = match ch {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                '{' => self.single(TokenKind::LBrace),
                '}' => self.single(TokenKind::RBrace),
                ';' => self.single(TokenKind::Semicolon),
                ',' => self.single(TokenKind::Comma),
                ':' => self.single(TokenKind::Colon),
                '?' => self.single(TokenKind::Question),
                '+' => self.single(TokenKind::Plus),
                '-' => self.single(TokenKind::Minus),
                '*' => self.single(TokenKind::Star),
                '/' => self.single(TokenKind::Slash),
                '%' => self.single(TokenKind::Percent),
                '^' => self.single(TokenKind::Caret),
                '#' => self.single(TokenKind::Hash),
                '<' => self.one_or_two('=', TokenKind::Lt, TokenKind::Le),
                '>' => self.one_or_two('=', TokenKind::Gt, TokenKind::Ge),
                '=' => self.one_or_two('=', TokenKind::Assign, TokenKind::EqEq),
                '!' => self.one_or_two('=', TokenKind::Not, TokenKind::Ne),
                '&' => self.pair('&', TokenKind::AndAnd)?,
                '|' => self.pair('|', TokenKind::OrOr)?,
                '"' => self.scan_string()?,
                '0'..='9' => self.scan_number()?,
                '.' if self.peek2().is_some_and(|c| c.is_ascii_digit()) => self.scan_number()?,
                _ if is_ident_start(ch) => {
                    match self.scan_identifier()? {
                        Some(kind) => kind,
                        // A directive was consumed; keep scanning.
                        None => continue,
                    }
                }
                _ => {
                    self.bump();
                    return Err(SyntaxError::new(
                        self.loc.clone(),
                        format!("unexpected character '{ch}'"),
                    ));
                }
            };

            return Ok(Token::new(kind, self.loc.clone()));
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn one_or_two(&mut self, second: char, short: TokenKind, long: TokenKind) -> TokenKind {
        self.bump();
        if self.peek() == Some(second) {
            self.bump();
            long
        } else {
            short
        }
    }

    fn pair(&mut self, second: char, kind: TokenKind) -> Result<TokenKind, SyntaxError> {
        let first = self.bump();
        if self.peek() == Some(second) {
            self.bump();
            Ok(kind)
        } else {
            Err(SyntaxError::new(
                self.loc.clone(),
                format!("unexpected character '{}'", first.unwrap_or(second)),
            ))
        }
    }

    fn peek(&self) -> Option<char> {
        self.streams.last().and_then(|s| s.rest().chars().next())
    }

    fn peek2(&self) -> Option<char> {
        let mut chars = self.streams.last()?.rest().chars();
        chars.next();
        chars.next()
    }

    /// Consumes one character, tracking line/column. CRLF counts as a single
    /// newline and is consumed whole (the `'\r'` is returned).
    fn bump(&mut self) -> Option<char> {
        let stream = self.streams.last_mut()?;
        let ch = stream.rest().chars().next()?;
        stream.pos += ch.len_utf8();
        match ch {
            '\n' => {
                self.loc.end.line += 1;
                self.loc.end.column = 1;
            }
            '\r' => {
                if stream.rest().starts_with('\n') {
                    stream.pos += 1;
                }
                self.loc.end.line += 1;
                self.loc.end.column = 1;
            }
            _ => self.loc.end.column += 1,
        }
        Some(ch)
    }

    /// Pops one include level; returns false when the outermost stream ended.
    fn pop_stream(&mut self) -> bool {
        self.streams.pop();
        if self.streams.is_empty() {
            return false;
        }
        match self.loc.begin.parent.clone() {
            Some(parent) => {
                self.loc = (*parent).clone();
                true
            }
            None => false,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\n' | '\r') => {
                    self.bump();
                }
                Some('/') => match self.peek2() {
                    Some('/') => {
                        self.bump();
                        self.bump();
                        while let Some(ch) = self.peek() {
                            if ch == '\n' || ch == '\r' {
                                break;
                            }
                            self.bump();
                        }
                    }
                    Some('*') => {
                        self.bump();
                        self.bump();
                        let mut prev = ' ';
                        while let Some(ch) = self.bump() {
                            if prev == '*' && ch == '/' {
                                break;
                            }
                            prev = ch;
                        }
                    }
                    _ => break,
                },
                _ => break,
            }
        }
    }

    fn scan_string(&mut self) -> Result<TokenKind, SyntaxError> {
        self.bump(); // opening quote
        self.scratch.clear();
        loop {
            match self.bump() {
                None => {
                    return Err(SyntaxError::new(
                        self.loc.clone(),
                        "unterminated string".to_string(),
                    ));
                }
                Some('"') => break,
                Some('\\') => {
                    let Some(escaped) = self.bump() else {
                        return Err(SyntaxError::new(
                            self.loc.clone(),
                            "unterminated string".to_string(),
                        ));
                    };
                    match escaped {
                        'n' => self.scratch.push('\n'),
                        'r' => self.scratch.push('\r'),
                        't' => self.scratch.push('\t'),
                        '"' => self.scratch.push('"'),
                        '\\' => self.scratch.push('\\'),
                        other => self.scratch.push(other),
                    }
                }
                Some(ch) => self.scratch.push(ch),
            }
        }
        Ok(TokenKind::Str(std::mem::take(&mut self.scratch)))
    }

    fn scan_number(&mut self) -> Result<TokenKind, SyntaxError> {
        let mut lexeme = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                lexeme.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') {
            lexeme.push('.');
            self.bump();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    lexeme.push(ch);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            lexeme.push('e');
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                if let Some(sign) = self.bump() {
                    lexeme.push(sign);
                }
            }
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    lexeme.push(ch);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        match lexeme.parse::<f64>() {
            Ok(value) => Ok(TokenKind::Number(value)),
            Err(_) => Err(SyntaxError::new(
                self.loc.clone(),
                format!("invalid number \"{lexeme}\""),
            )),
        }
    }

    /// Scans an identifier or keyword. Returns `None` when the identifier was
    /// an `include`/`use` directive consumed in place.
    fn scan_identifier(&mut self) -> Result<Option<TokenKind>, SyntaxError> {
        let start_column = self.loc.begin.column;
        let mut name = String::new();
        if self.peek() == Some('$') {
            if let Some(dollar) = self.bump() {
                name.push(dollar);
            }
        }
        while let Some(ch) = self.peek() {
            if is_ident_continue(ch) {
                name.push(ch);
                self.bump();
            } else {
                break;
            }
        }

        let body = name.strip_prefix('$').unwrap_or(&name);
        let graphemes = num_graphemes(body);
        if graphemes < 0 || body.is_empty() {
            return Err(SyntaxError::new(
                self.loc.clone(),
                format!("invalid identifier \"{name}\""),
            ));
        }
        // Columns advance per grapheme cluster, not per scalar.
        let dollar = u32::from(name.starts_with('$'));
        self.loc.end.column = start_column + dollar + graphemes as u32;

        match name.as_str() {
            "include" => {
                self.directive(true)?;
                Ok(None)
            }
            "use" => {
                self.directive(false)?;
                Ok(None)
            }
            _ => Ok(Some(
                TokenKind::keyword(&name).unwrap_or(TokenKind::Ident(name)),
            )),
        }
    }

    /// Handles `include<NAME>` / `use<NAME>` after the leading word.
    fn directive(&mut self, is_include: bool) -> Result<(), SyntaxError> {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
        if self.peek() != Some('<') {
            return Err(SyntaxError::new(
                self.loc.clone(),
                "expected '<' after include/use".to_string(),
            ));
        }
        self.bump();
        let mut name = String::new();
        loop {
            match self.bump() {
                None | Some('\n') | Some('\r') => {
                    return Err(SyntaxError::new(
                        self.loc.clone(),
                        "unterminated include/use filename".to_string(),
                    ));
                }
                Some('>') => break,
                Some(ch) => name.push(ch),
            }
        }

        let file = self
            .sources
            .resolve(&name, self.loc.begin.src)
            .map_err(|e| SyntaxError::new(self.loc.clone(), e.to_string()))?;
        if is_include {
            self.push_include(file)
        } else {
            self.uses.insert(file);
            Ok(())
        }
    }

    /// Pushes the included file's stream, refusing cycles along the
    /// include chain.
    fn push_include(&mut self, file: FileHandle) -> Result<(), SyntaxError> {
        if self.loc.include_chain_contains(file) {
            return Err(SyntaxError::new(
                self.loc.clone(),
                "recursive include detected".to_string(),
            ));
        }
        let text = self
            .sources
            .open(file)
            .map_err(|e| SyntaxError::new(self.loc.clone(), e.to_string()))?;
        let parent = Rc::new(self.loc.clone());
        self.streams.push(Stream { text, pos: 0 });
        self.loc = Location::start_of(file, Some(parent));
        Ok(())
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch == '$' || unicode_xid::UnicodeXID::is_xid_start(ch)
        || (!ch.is_ascii() && unicode_xid::UnicodeXID::is_xid_continue(ch))
}

fn is_ident_continue(ch: char) -> bool {
    ch == '_' || unicode_xid::UnicodeXID::is_xid_continue(ch)
}

/// Counts grapheme clusters in `s`; negative when the cluster sequence is not
/// a valid identifier (first cluster must begin with ID_Start or `_`, the
/// rest with ID_Continue).
fn num_graphemes(s: &str) -> i32 {
    let mut count = 0i32;
    let mut valid = true;
    for (i, grapheme) in s.graphemes(true).enumerate() {
        if let Some(first) = grapheme.chars().next() {
            if i == 0 {
                if first != '_' && !unicode_xid::UnicodeXID::is_xid_start(first) {
                    valid = false;
                }
            } else if !unicode_xid::UnicodeXID::is_xid_continue(first) {
                valid = false;
            }
        }
        count += 1;
    }
    if valid { count } else { -count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::MemorySources;

    fn tokens_of(source: &str) -> Vec<TokenKind> {
        let mut sources = MemorySources::new();
        let root = sources.add("root", source);
        let mut scanner = Scanner::new(&mut sources, root).unwrap();
        let mut kinds = Vec::new();
        loop {
            let token = scanner.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                break;
            }
            kinds.push(token.kind);
        }
        kinds
    }

    #[test]
    fn test_simple_tokens() {
        assert_eq!(
            tokens_of("( ) { } [ ] ; , : ?"),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Colon,
                TokenKind::Question,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens_of("<= >= == != && || < > = ! ^"),
            vec![
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::EqEq,
                TokenKind::Ne,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Assign,
                TokenKind::Not,
                TokenKind::Caret,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens_of("42 3.14 .5 1e3 2.5e-2"),
            vec![
                TokenKind::Number(42.0),
                TokenKind::Number(3.14),
                TokenKind::Number(0.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.025),
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            tokens_of(r#""hello" "a\nb\"c\\d""#),
            vec![
                TokenKind::Str("hello".to_string()),
                TokenKind::Str("a\nb\"c\\d".to_string()),
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            tokens_of("module function if else let for each true false undef cube $fn"),
            vec![
                TokenKind::Module,
                TokenKind::Function,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::Let,
                TokenKind::For,
                TokenKind::Each,
                TokenKind::True,
                TokenKind::False,
                TokenKind::Undef,
                TokenKind::Ident("cube".to_string()),
                TokenKind::Ident("$fn".to_string()),
            ]
        );
    }

    #[test]
    fn test_unicode_identifier() {
        assert_eq!(
            tokens_of("naïve + 齿轮"),
            vec![
                TokenKind::Ident("naïve".to_string()),
                TokenKind::Plus,
                TokenKind::Ident("齿轮".to_string()),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens_of("1 // comment\n2 /* multi\nline */ 3"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.0),
                TokenKind::Number(3.0),
            ]
        );
    }

    #[test]
    fn test_use_records_dependency() {
        let mut sources = MemorySources::new();
        let root = sources.add("root", "use<lib> x = 1;");
        let lib = sources.add("lib", "y = 2;");
        let mut scanner = Scanner::new(&mut sources, root).unwrap();
        while scanner.next_token().unwrap().kind != TokenKind::Eof {}
        assert!(scanner.uses().contains(&lib));
    }

    #[test]
    fn test_include_splices_stream() {
        let mut sources = MemorySources::new();
        let root = sources.add("root", "1 include<lib>\n3");
        sources.add("lib", "2");
        let mut scanner = Scanner::new(&mut sources, root).unwrap();
        let mut numbers = Vec::new();
        loop {
            let token = scanner.next_token().unwrap();
            match token.kind {
                TokenKind::Number(n) => numbers.push(n),
                TokenKind::Eof => break,
                _ => {}
            }
        }
        assert_eq!(numbers, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_recursive_include_detected() {
        let mut sources = MemorySources::new();
        let a = sources.add("a", "include<b>");
        let b = sources.add("b", "include<a>");
        let mut scanner = Scanner::new(&mut sources, a).unwrap();
        let err = loop {
            match scanner.next_token() {
                Ok(token) if token.kind == TokenKind::Eof => panic!("cycle not detected"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(err.message.contains("recursive include"));
        // The failure location lies inside `b`, whose include chain leads
        // back through `a`.
        assert!(err.loc.include_chain_contains(a));
        assert!(err.loc.include_chain_contains(b));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let mut sources = MemorySources::new();
        // A bare combining mark cannot begin an identifier cluster sequence.
        let root = sources.add("root", "x \u{0301}y");
        let mut scanner = Scanner::new(&mut sources, root).unwrap();
        assert_eq!(
            scanner.next_token().unwrap().kind,
            TokenKind::Ident("x".to_string())
        );
        let err = scanner.next_token().unwrap_err();
        assert!(err.message.contains("invalid identifier"));
    }

    #[test]
    fn test_num_graphemes_validation() {
        assert_eq!(num_graphemes("abc"), 3);
        assert_eq!(num_graphemes("naïve"), 5);
        assert_eq!(num_graphemes("_x1"), 3);
        assert!(num_graphemes("1abc") < 0);
    }

    #[test]
    fn test_crlf_is_one_newline() {
        let mut sources = MemorySources::new();
        let root = sources.add("root", "1\r\n2");
        let mut scanner = Scanner::new(&mut sources, root).unwrap();
        let _one = scanner.next_token().unwrap();
        let two = scanner.next_token().unwrap();
        assert_eq!(two.loc.begin.line, 2);
        assert_eq!(two.loc.begin.column, 1);
    }
}
