//! Handles Oba's lexical analysis.
//!
//! Contains the [Scanner] which implements an [Iterator] that yields [Lexeme]s, each of which
//! represents a [Token].
//!
//! # Example
//!
//! ```
//! use oba::scanner::{Scanner, Lexeme, Token};
//! let scanner = Scanner::new("debug 1 + 2");
//! let tokens: Vec<_> = scanner
//!     .map(|lexeme| lexeme.token())
//!     .take_while(|&token| token != Token::Eof) // scanner will yield Eof forever...
//!     .collect();
//!
//! use Token::*;
//! assert_eq!(
//!     vec![Debug, Number, Plus, Number],
//!     tokens
//! );
//! ```
//!
//! Unlike most whitespace, a line feed is significant in Oba: it separates statements. The
//! scanner therefore emits a [Token::Newline] for every `'\n'`, carrying the line it terminates,
//! and leaves it to the parser to collapse runs of them.

use enum_map::Enum;

/// A lexeme from one contiguous string of some Oba source code.
#[derive(Clone, Copy, Debug)]
pub struct Lexeme<'a> {
    /// The [Token] of this lexeme.
    token: Token,
    /// The actual text from the source code.
    text: &'a str,
    /// The line where this lexeme came from.
    line: usize,
}

/// What _type_ of [Lexeme] you have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[rustfmt::skip]
pub enum Token {
    // Single-character tokens.
    LeftParen, RightParen,
    LeftBrace, RightBrace,
    Comma, Minus, Plus,
    Star, Slash,
    Bar, Semicolon,
    // One or two character tokens
    Bang, BangEqual,
    Equal, EqualEqual, EqualGreater,
    Greater, GreaterEqual,
    Less, LessEqual,
    // Literals
    Identifier, StrLiteral, Number,
    // Keywords
    Let, Fn, Debug,
    If, Else, Match,
    True, False,

    // Others
    Newline, Error, Eof
}

/// Scans Oba source code and iteratively yields [Lexeme]s.
///
/// The scanner is stateful, and therefore, can only be used to do one pass over the source code
/// string. Once the whole source code has been scanned, the scanner will forever yield
/// [Token::Eof].
#[derive(Debug)]
pub struct Scanner<'a> {
    start: &'a str,
    current: &'a str,
    line: usize,
}

impl<'a> Scanner<'a> {
    /// Start scanning the given string of source code.
    pub fn new(source: &'a str) -> Self {
        Scanner {
            start: source,
            current: source,
            line: 1,
        }
    }

    /// Yield the next [Lexeme] from the string. Once the scanner has reached the end-of-file,
    /// this function will always return an end-of-file lexeme.
    pub fn scan_token(&mut self) -> Lexeme<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_lexeme(Token::Eof);
        }

        match self.advance() {
            c if is_id_start(c) => self.identifier(),
            c if c.is_ascii_digit() => self.number(),
            '\n' => {
                // The newline token belongs to the line it terminates.
                let lexeme = self.make_lexeme(Token::Newline);
                self.line += 1;
                lexeme
            }
            '(' => self.make_lexeme(Token::LeftParen),
            ')' => self.make_lexeme(Token::RightParen),
            '{' => self.make_lexeme(Token::LeftBrace),
            '}' => self.make_lexeme(Token::RightBrace),
            ',' => self.make_lexeme(Token::Comma),
            '-' => self.make_lexeme(Token::Minus),
            '+' => self.make_lexeme(Token::Plus),
            '/' => self.make_lexeme(Token::Slash),
            '*' => self.make_lexeme(Token::Star),
            '|' => self.make_lexeme(Token::Bar),
            ';' => self.make_lexeme(Token::Semicolon),
            '!' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::BangEqual
                } else {
                    Token::Bang
                })
            }
            '=' => {
                if self.match_and_advance('=') {
                    self.make_lexeme(Token::EqualEqual)
                } else if self.match_and_advance('>') {
                    self.make_lexeme(Token::EqualGreater)
                } else {
                    self.make_lexeme(Token::Equal)
                }
            }
            '<' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::LessEqual
                } else {
                    Token::Less
                })
            }
            '>' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::GreaterEqual
                } else {
                    Token::Greater
                })
            }
            '"' => self.string(),
            _ => self.error_token("Unexpected character"),
        }
    }

    /// Returns `true` if we've reached the end of the source code.
    pub fn is_at_end(&self) -> bool {
        self.current.is_empty()
    }

    pub fn make_sentinel(&self, message: &'static str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Error,
            text: message,
            line: 0,
        }
    }

    /// Advances self.current, s.t., self.start < self.current are a reference to the same str.
    /// Returns the next valid char.
    ///
    /// # Panics
    ///
    /// If this is called at the end of string.
    fn advance(&mut self) -> char {
        let c = match self.current.chars().next() {
            Some(c) => c,
            None => panic!("called advance() at end of file"),
        };

        let len = c.len_utf8();
        self.current = &self.current[len..];
        assert!(self.current.len() < self.start.len());

        c
    }

    /// Peek at the first char in self.current.
    fn peek(&self) -> char {
        self.current.chars().next().unwrap_or('\0')
    }

    /// Peek at the second char in self.current.
    fn peek_next(&self) -> char {
        let mut chars = self.current.chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    /// Matches the expected character. If the next character matches, returns true and advances
    /// self.current. Otherwise, return false and does not update anything.
    fn match_and_advance(&mut self, expected: char) -> bool {
        if self.is_at_end() {
            return false;
        }

        let next_char = self.peek();
        if next_char != expected {
            return false;
        }

        self.current = &self.current[next_char.len_utf8()..];
        true
    }

    /// Skips whitespace and comments. A line feed is NOT whitespace here: it is scanned as a
    /// [Token::Newline].
    fn skip_whitespace(&mut self) {
        loop {
            let c = self.peek();
            match c {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                // Comments are "whitespace", but the line feed that ends one is not.
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            };
        }
    }

    /// Scan an identifier or keyword.
    fn identifier(&mut self) -> Lexeme<'a> {
        while is_id_continue(self.peek()) {
            self.advance();
        }

        self.make_lexeme(self.identifier_type())
    }

    /// Scan a string literal. Expects the starting quote to have been consumed.
    ///
    /// Oba strings have no escape sequences; the contents run to the closing quote.
    fn string(&mut self) -> Lexeme<'a> {
        while self.peek() != '"' && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        assert_eq!('"', self.advance());
        self.make_lexeme(Token::StrLiteral)
    }

    /// Scan a number literal. Expects the first digit to have already been consumed.
    fn number(&mut self) -> Lexeme<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            // Consume the decimal point
            self.advance();

            // Consume the digits after the decimal point
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_lexeme(Token::Number)
    }

    /// Check if the identifier is a keyword, or a normal identifier.
    fn identifier_type(&self) -> Token {
        let mut chars = self.start.chars();

        match chars.next().unwrap_or('\0') {
            'd' => self.check_keyword("debug", Token::Debug),
            'e' => self.check_keyword("else", Token::Else),
            'f' => match chars.next().unwrap_or('\0') {
                'a' => self.check_keyword("false", Token::False),
                'n' => self.check_keyword("fn", Token::Fn),
                _ => Token::Identifier,
            },
            'i' => self.check_keyword("if", Token::If),
            'l' => self.check_keyword("let", Token::Let),
            'm' => self.check_keyword("match", Token::Match),
            't' => self.check_keyword("true", Token::True),
            _ => Token::Identifier,
        }
    }

    /// Confirms that the current lexeme is a keyword or lexeme.
    fn check_keyword(&self, keyword_text: &'static str, keyword: Token) -> Token {
        let token_length = self.start.len() - self.current.len();
        let lexeme = &self.start[..token_length];

        if lexeme == keyword_text {
            keyword
        } else {
            Token::Identifier
        }
    }

    /// Returns a lexeme with [Token::Error] as its token.
    fn error_token(&self, message: &'a str) -> Lexeme<'a> {
        assert_ne!(self.start, self.current);
        Lexeme {
            token: Token::Error,
            text: message,
            line: self.line,
        }
    }

    /// Returns a [Lexeme] from the span between self.start and self.current with the given
    /// [Token].
    fn make_lexeme(&self, token: Token) -> Lexeme<'a> {
        assert!(self.current.len() <= self.start.len());
        let extent = self.start.len() - self.current.len();
        let text = &self.start[..extent];

        Lexeme {
            token,
            text,
            line: self.line,
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Lexeme<'a>;

    fn next(&mut self) -> Option<Lexeme<'a>> {
        Some(self.scan_token())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // This iterator is infinite.
        (usize::MAX, None)
    }
}

impl<'a> Lexeme<'a> {
    /// Return the line number this token was found on.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Return the literal text of this token. For string literals, this always includes the
    /// quotes.
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Return the [Token] of this lexeme.
    pub fn token(&self) -> Token {
        self.token
    }

    /// A lexeme that does not come from the source text. The compiler uses this to reserve
    /// stack slots that no identifier in the program can ever resolve to.
    pub(crate) fn synthetic(text: &'a str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Identifier,
            text,
            line: 0,
        }
    }
}

///////////////////////////////////////////// Helpers /////////////////////////////////////////////

/// Returns true if this char can start an identifier or keyword.
fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Returns true if this char can be used after the first character of an identifier or keyword.
fn is_id_continue(c: char) -> bool {
    is_id_start(c) || c.is_ascii_digit()
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tokens_of(source: &str) -> Vec<Token> {
        Scanner::new(source)
            .map(|lexeme| lexeme.token())
            .take_while(|&token| token != Token::Eof)
            .collect()
    }

    #[test]
    fn scanning_every_keyword() {
        use Token::*;

        let source_code = "let truth = true
fn falsify x {
    if x {
        false
    } else {
        match x | true = false ;
    }
}
debug falsify(truth)";

        // One Newline token per line break, in source order.
        #[rustfmt::skip]
        let expected_tokens = vec![
            Let, Identifier, Equal, True, Newline,
            Fn, Identifier, Identifier, LeftBrace, Newline,
                If, Identifier, LeftBrace, Newline,
                    False, Newline,
                RightBrace, Else, LeftBrace, Newline,
                    Match, Identifier, Bar, True, Equal, False, Semicolon, Newline,
                RightBrace, Newline,
            RightBrace, Newline,
            Debug, Identifier, LeftParen, Identifier, RightParen,
        ];

        assert_eq!(expected_tokens, tokens_of(source_code));
    }

    #[test]
    fn one_and_two_character_operators() {
        use Token::*;

        assert_eq!(
            vec![
                Bang, BangEqual, Equal, EqualEqual, EqualGreater, Less, LessEqual, Greater,
                GreaterEqual, Plus, Minus, Star, Slash, Comma, Bar, Semicolon
            ],
            tokens_of("! != = == => < <= > >= + - * / , | ;")
        );
    }

    #[test]
    fn newlines_carry_the_line_they_terminate() {
        let mut scanner = Scanner::new("1\n\n2");

        assert_eq!(Token::Number, scanner.scan_token().token());

        let first_break = scanner.scan_token();
        assert_eq!(Token::Newline, first_break.token());
        assert_eq!(1, first_break.line());

        let second_break = scanner.scan_token();
        assert_eq!(Token::Newline, second_break.token());
        assert_eq!(2, second_break.line());

        let two = scanner.scan_token();
        assert_eq!(Token::Number, two.token());
        assert_eq!(3, two.line());
    }

    #[test]
    fn comments_do_not_eat_the_line_break() {
        use Token::*;
        assert_eq!(
            vec![Number, Newline, Number],
            tokens_of("1 // a comment\n2")
        );
    }

    #[test]
    fn string_literals_keep_their_quotes() {
        let mut scanner = Scanner::new("\"foo bar\"");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::StrLiteral, lexeme.token());
        assert_eq!("\"foo bar\"", lexeme.text());
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"oops");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::Error, lexeme.token());
        assert_eq!("Unterminated string", lexeme.text());
    }

    #[test]
    fn fractional_numbers() {
        let mut scanner = Scanner::new("3.25");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::Number, lexeme.token());
        assert_eq!("3.25", lexeme.text());
    }

    #[test]
    fn keyword_prefixes_are_identifiers() {
        use Token::*;
        assert_eq!(
            vec![Identifier, Identifier, Identifier, Identifier],
            tokens_of("letter fnord matches debugger")
        );
    }

    #[test]
    fn invalid_character_is_an_error() {
        let mut scanner = Scanner::new("#");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::Error, lexeme.token());
        assert_eq!("Unexpected character", lexeme.text());
    }
}
