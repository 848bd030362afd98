//! Statement lexer for CQL migration scripts
//!
//! Splits a script into executable statements. Comments (`--`, `//`,
//! `/* ... */`) are dropped, string literals and quoted identifiers are kept
//! intact (including `;` inside them), and newlines outside literals collapse
//! to spaces so each statement is a single logical line.

use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    LineComment,
    BlockComment,
    QuotedIdentifier,
    StringLiteral,
}

/// Single-pass scanner yielding trimmed, non-empty statements
///
/// The iterator is finite and cannot be restarted; build a new lexer to scan
/// the same script again.
///
/// # Example
///
/// ```
/// use schemaguard::migration::CqlLexer;
///
/// let script = "-- users\nCREATE TABLE users (id uuid PRIMARY KEY);\nINSERT INTO users (id) VALUES (uuid());";
/// let statements: Vec<String> = CqlLexer::new(script).collect();
/// assert_eq!(statements, vec![
///     "CREATE TABLE users (id uuid PRIMARY KEY)".to_string(),
///     "INSERT INTO users (id) VALUES (uuid())".to_string(),
/// ]);
/// ```
pub struct CqlLexer<'a> {
    chars: Peekable<Chars<'a>>,
    state: State,
    buffer: String,
    exhausted: bool,
}

impl<'a> CqlLexer<'a> {
    #[must_use]
    pub fn new(script: &'a str) -> Self {
        Self {
            chars: script.chars().peekable(),
            state: State::Default,
            buffer: String::new(),
            exhausted: false,
        }
    }

    fn next_is(&mut self, expected: char) -> bool {
        self.chars.peek() == Some(&expected)
    }

    fn take_statement(&mut self) -> Option<String> {
        let statement = self.buffer.trim().to_string();
        self.buffer.clear();
        if statement.is_empty() {
            None
        } else {
            Some(statement)
        }
    }

    /// Inside a quoted section: a doubled quote is an escaped quote, a single
    /// one closes the section.
    fn scan_quoted(&mut self, c: char, quote: char) {
        self.buffer.push(c);
        if c == quote {
            if self.next_is(quote) {
                self.chars.next();
                self.buffer.push(quote);
            } else {
                self.state = State::Default;
            }
        }
    }
}

impl Iterator for CqlLexer<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.exhausted {
            return None;
        }

        while let Some(c) = self.chars.next() {
            match self.state {
                State::Default => match c {
                    '-' if self.next_is('-') => {
                        self.chars.next();
                        self.state = State::LineComment;
                    }
                    '/' if self.next_is('/') => {
                        self.chars.next();
                        self.state = State::LineComment;
                    }
                    '/' if self.next_is('*') => {
                        self.chars.next();
                        self.state = State::BlockComment;
                    }
                    '\n' | '\r' => self.buffer.push(' '),
                    '"' => {
                        self.buffer.push(c);
                        self.state = State::QuotedIdentifier;
                    }
                    '\'' => {
                        self.buffer.push(c);
                        self.state = State::StringLiteral;
                    }
                    ';' => {
                        if let Some(statement) = self.take_statement() {
                            return Some(statement);
                        }
                    }
                    _ => self.buffer.push(c),
                },
                State::LineComment => {
                    if c == '\n' {
                        // keep tokens on either side of the comment apart
                        self.buffer.push(' ');
                        self.state = State::Default;
                    }
                }
                State::BlockComment => {
                    if c == '*' && self.next_is('/') {
                        self.chars.next();
                        self.state = State::Default;
                    }
                }
                State::QuotedIdentifier => self.scan_quoted(c, '"'),
                State::StringLiteral => self.scan_quoted(c, '\''),
            }
        }

        self.exhausted = true;
        self.take_statement()
    }
}

/// Split a script into its statements
#[must_use]
pub fn split_statements(script: &str) -> Vec<String> {
    CqlLexer::new(script).collect()
}
