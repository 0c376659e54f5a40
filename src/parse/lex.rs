//! Tokenizing the surface language.
//!
//! This module holds the tokens that characterize the source language
//! ([`Token`]). It is used by the parser to facilitate the conversion of
//! source code into an AST.
//!
//! The entry point is [`lex`], which produces a positioned token stream
//! plus any lexical diagnostics (the lexer recovers from all of them).

use logos::{Lexer, Logos};

use crate::err::Diagnostic;

/// A unit of information in source code.
#[derive(Debug, Logos, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"(;|#|//)[^\n]*")]
#[logos(error = LexErr)]
pub enum Token {
    // These regexes span over tokens that are technically invalid
    // (e.g., 23trst matches as a number even though it shouldn't).
    // This is intended: the callback validates the whole unit and
    // reports one error for it.

    /// A numeric literal (e.g., `9`, `0x7F`, `7Fh`, `0b101`).
    ///
    /// Signs are not part of the token; unary minus comes from the parser.
    #[regex(r"\d\w*", lex_number)]
    #[regex(r"[0-9A-Fa-f]+[hH]", lex_number, priority = 10)]
    Number(u16),

    /// A keyword or identifier (see [`Word`]).
    #[regex(r"[A-Za-z_]\w*", lex_word)]
    Word(Word),

    /// A string literal, delimited by `"` or `'`.
    #[token("\"", |lx| lex_string(lx, '"'))]
    #[token("'", |lx| lex_string(lx, '\''))]
    Str(String),

    /// An operator or punctuation mark (see [`Op`]).
    #[token("==", |_| Op::Eq)]
    #[token("!=", |_| Op::Ne)]
    #[token("<=", |_| Op::Le)]
    #[token(">=", |_| Op::Ge)]
    #[token("<",  |_| Op::Lt)]
    #[token(">",  |_| Op::Gt)]
    #[token("=",  |_| Op::Assign)]
    #[token("+",  |_| Op::Plus)]
    #[token("-",  |_| Op::Minus)]
    #[token("*",  |_| Op::Star)]
    #[token("/",  |_| Op::Slash)]
    #[token("%",  |_| Op::Percent)]
    #[token("(",  |_| Op::LParen)]
    #[token(")",  |_| Op::RParen)]
    #[token(",",  |_| Op::Comma)]
    Op(Op),

    /// A line break. Only emitted for non-empty logical lines.
    #[token("\n")]
    NewLine,
}

macro_rules! keyword_enum {
    ($($kw:ident),+ $(,)?) => {
        /// A keyword or identifier.
        ///
        /// Keywords are case-insensitive (`WHILE` lexes the same as
        /// `while`); anything that is not a keyword becomes
        /// [`Word::Ident`].
        #[derive(Debug, PartialEq, Eq, Clone)]
        pub enum Word {
            $(
                #[allow(missing_docs)]
                $kw
            ),+,
            /// A user identifier (variable or program name).
            Ident(String),
        }

        impl std::str::FromStr for Word {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case(stringify!($kw)) {
                        return Ok(Self::$kw);
                    }
                )+
                Ok(Self::Ident(s.to_string()))
            }
        }

        impl std::fmt::Display for Word {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$kw => {
                        for c in stringify!($kw).chars() {
                            std::fmt::Write::write_char(f, c.to_ascii_lowercase())?;
                        }
                        Ok(())
                    }),+,
                    Self::Ident(id) => f.write_str(id),
                }
            }
        }
    };
}
keyword_enum! {
    Program, End, If, Else, While, For, Print, Input, Var,
    Then, Do, To, Step, And, Or, Not, True, False,
}

/// An operator or punctuation token.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Op {
    #[allow(missing_docs)] Eq,
    #[allow(missing_docs)] Ne,
    #[allow(missing_docs)] Le,
    #[allow(missing_docs)] Ge,
    #[allow(missing_docs)] Lt,
    #[allow(missing_docs)] Gt,
    #[allow(missing_docs)] Assign,
    #[allow(missing_docs)] Plus,
    #[allow(missing_docs)] Minus,
    #[allow(missing_docs)] Star,
    #[allow(missing_docs)] Slash,
    #[allow(missing_docs)] Percent,
    #[allow(missing_docs)] LParen,
    #[allow(missing_docs)] RParen,
    #[allow(missing_docs)] Comma,
}
impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Op::Eq => "==", Op::Ne => "!=", Op::Le => "<=", Op::Ge => ">=",
            Op::Lt => "<", Op::Gt => ">", Op::Assign => "=",
            Op::Plus => "+", Op::Minus => "-", Op::Star => "*",
            Op::Slash => "/", Op::Percent => "%",
            Op::LParen => "(", Op::RParen => ")", Op::Comma => ",",
        };
        f.write_str(s)
    }
}

/// Any errors raised in attempting to tokenize an input stream.
///
/// The lexer recovers from all of these; they surface as diagnostics.
#[derive(Debug, PartialEq, Clone, Default)]
pub enum LexErr {
    /// A numeric literal with invalid digits for its form.
    InvalidNumber,
    /// A string literal missing its closing quote. Carries the
    /// characters scanned so far, which still become a token.
    UnclosedString(String),
    /// A character that occurs in no token.
    #[default]
    Unexpected,
}
impl std::fmt::Display for LexErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexErr::InvalidNumber     => f.write_str("invalid numeric literal"),
            LexErr::UnclosedString(_) => f.write_str("unterminated string literal"),
            LexErr::Unexpected        => f.write_str("unexpected character"),
        }
    }
}
impl std::error::Error for LexErr {}
impl crate::err::Error for LexErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            LexErr::InvalidNumber     => Some("numbers are decimal, 0x… hex, …h hex, or 0b… binary".into()),
            LexErr::UnclosedString(_) => Some("add a closing quote before the end of the line".into()),
            LexErr::Unexpected        => None,
        }
    }
}

fn lex_number(lx: &Lexer<'_, Token>) -> Result<u16, LexErr> {
    // The literal forms are shared with the assembler's immediates,
    // minus the sign (which the lexer never sees).
    crate::asm::parse_imm(lx.slice()).ok_or(LexErr::InvalidNumber)
}

fn lex_word(lx: &Lexer<'_, Token>) -> Word {
    lx.slice().parse().unwrap_or_else(|_| unreachable!("Word parsing is infallible"))
}

fn lex_string(lx: &mut Lexer<'_, Token>, delim: char) -> Result<String, LexErr> {
    let rem = lx.remainder();
    let mut buf = String::new();
    let mut chars = rem.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '\n' => {
                lx.bump(i);
                return Err(LexErr::UnclosedString(buf));
            }
            c if c == delim => {
                lx.bump(i + c.len_utf8());
                return Ok(buf);
            }
            '\\' => match chars.next() {
                Some((_, 'n'))  => buf.push('\n'),
                Some((_, 't'))  => buf.push('\t'),
                Some((_, '\\')) => buf.push('\\'),
                Some((_, '"'))  => buf.push('"'),
                Some((_, '\'')) => buf.push('\''),
                // Any other escaped character stands for itself.
                Some((_, other)) => buf.push(other),
                None => {
                    lx.bump(rem.len());
                    return Err(LexErr::UnclosedString(buf));
                }
            },
            c => buf.push(c),
        }
    }

    lx.bump(rem.len());
    Err(LexErr::UnclosedString(buf))
}

/// A token together with its 1-based source position.
#[derive(Debug, PartialEq, Clone)]
pub struct Spanned {
    /// The token itself.
    pub token: Token,
    /// 1-based source line.
    pub line: usize,
    /// 1-based column (in bytes) within the line.
    pub col: usize,
}

/// The lexer's output: positioned tokens plus the line the stream ends on.
///
/// The end of the token vector is the `EOF`; [`TokenStream::eof_line`]
/// positions diagnostics that point past the last token.
#[derive(Debug, PartialEq, Clone)]
pub struct TokenStream {
    /// The tokens, in source order.
    pub tokens: Vec<Spanned>,
    /// The line the source ends on.
    pub eof_line: usize,
}

/// Tokenizes source text.
///
/// All lexical failures are recovered from: unknown characters are
/// skipped, invalid numbers are dropped, and an unterminated string still
/// produces a token with the characters scanned so far. Each failure
/// emits one diagnostic.
pub fn lex(src: &str) -> (TokenStream, Vec<Diagnostic>) {
    let index = LineIndex::new(src);
    let mut lexer = Token::lexer(src);
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut line_has_tokens = false;

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let (line, col) = index.position(span.start);

        match result {
            Ok(Token::NewLine) => {
                // Blank and comment-only lines emit no NEWLINE.
                if line_has_tokens {
                    tokens.push(Spanned { token: Token::NewLine, line, col });
                }
                line_has_tokens = false;
            }
            Ok(token) => {
                line_has_tokens = true;
                tokens.push(Spanned { token, line, col });
            }
            Err(LexErr::UnclosedString(partial)) => {
                diagnostics.push(Diagnostic::error(line, "unterminated string literal"));
                line_has_tokens = true;
                tokens.push(Spanned { token: Token::Str(partial), line, col });
            }
            Err(e @ LexErr::InvalidNumber) => {
                diagnostics.push(Diagnostic::error(line, format!("{e} '{}'", lexer.slice())));
            }
            Err(e @ LexErr::Unexpected) => {
                diagnostics.push(Diagnostic::error(line, format!("{e} '{}'", lexer.slice())));
            }
        }
    }

    let eof_line = index.position(src.len()).0;
    (TokenStream { tokens, eof_line }, diagnostics)
}

/// Byte-index to (line, column) translation for a source string.
struct LineIndex {
    nl_indices: Vec<usize>,
}
impl LineIndex {
    fn new(src: &str) -> Self {
        Self {
            nl_indices: src.match_indices('\n').map(|(i, _)| i).collect(),
        }
    }

    /// 1-based (line, column) of a byte index.
    fn position(&self, byte: usize) -> (usize, usize) {
        let line = self.nl_indices.partition_point(|&i| i < byte);
        let start = match line {
            0 => 0,
            _ => self.nl_indices[line - 1] + 1,
        };
        (line + 1, byte - start + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        let (stream, diagnostics) = lex(src);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        stream.tokens.into_iter().map(|s| s.token).collect()
    }

    fn ident(s: &str) -> Token {
        Token::Word(Word::Ident(s.to_string()))
    }

    #[test]
    fn numbers() {
        assert_eq!(
            kinds("0 123 0x7F 7Fh 0b101 0FFh"),
            [
                Token::Number(0),
                Token::Number(123),
                Token::Number(0x7F),
                Token::Number(0x7F),
                Token::Number(5),
                Token::Number(0xFF),
            ]
        );
    }

    #[test]
    fn hex_suffix_beats_identifier() {
        // All-hex-digit words with an h suffix are numbers.
        assert_eq!(kinds("FFh"), [Token::Number(0xFF)]);
        assert_eq!(kinds("deadh"), [Token::Number(0xDEAD)]);
        // A non-hex digit keeps it an identifier.
        assert_eq!(kinds("fgh"), [ident("fgh")]);
    }

    #[test]
    fn invalid_number_is_diagnosed_and_skipped() {
        let (stream, diagnostics) = lex("23trst");
        assert!(stream.tokens.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 1);
        assert!(diagnostics[0].message.contains("23trst"));
    }

    #[test]
    fn keywords_case_insensitive() {
        assert_eq!(
            kinds("while WHILE While"),
            [Token::Word(Word::While), Token::Word(Word::While), Token::Word(Word::While)]
        );
        assert_eq!(kinds("whileX"), [ident("whileX")]);
    }

    #[test]
    fn operators_prefer_multi_character() {
        assert_eq!(
            kinds("a <= b == c = d"),
            [
                ident("a"), Token::Op(Op::Le),
                ident("b"), Token::Op(Op::Eq),
                ident("c"), Token::Op(Op::Assign),
                ident("d"),
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(kinds(r#""hi there""#), [Token::Str("hi there".to_string())]);
        assert_eq!(kinds(r#"'single'"#), [Token::Str("single".to_string())]);
        assert_eq!(
            kinds(r#""a\nb\t\\\"\'x\q""#),
            [Token::Str("a\nb\t\\\"'xq".to_string())]
        );
    }

    #[test]
    fn unterminated_string_recovers() {
        let (stream, diagnostics) = lex("x = \"oops\ny = 1");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 1);
        // The partial token is still present, and lexing continues.
        assert!(stream.tokens.iter().any(|s| s.token == Token::Str("oops".to_string())));
        assert!(stream.tokens.iter().any(|s| s.token == Token::Number(1)));
    }

    #[test]
    fn comments_terminate_the_line() {
        assert_eq!(
            kinds("a = 1 ; tail\nb = 2 # tail\nc = 3 // tail"),
            [
                ident("a"), Token::Op(Op::Assign), Token::Number(1), Token::NewLine,
                ident("b"), Token::Op(Op::Assign), Token::Number(2), Token::NewLine,
                ident("c"), Token::Op(Op::Assign), Token::Number(3),
            ]
        );
    }

    #[test]
    fn blank_lines_emit_no_newline() {
        assert_eq!(
            kinds("a = 1\n\n  \n; only a comment\nb = 2\n"),
            [
                ident("a"), Token::Op(Op::Assign), Token::Number(1), Token::NewLine,
                ident("b"), Token::Op(Op::Assign), Token::Number(2), Token::NewLine,
            ]
        );
    }

    #[test]
    fn unknown_characters_are_skipped() {
        let (stream, diagnostics) = lex("a = 1 @ 2");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains('@'));
        assert_eq!(stream.tokens.len(), 4);
    }

    #[test]
    fn positions_are_one_based() {
        let (stream, _) = lex("a = 1\n  b = 2");
        assert_eq!((stream.tokens[0].line, stream.tokens[0].col), (1, 1));
        assert_eq!((stream.tokens[1].line, stream.tokens[1].col), (1, 3));
        let b = stream.tokens.iter()
            .find(|s| s.token == ident("b"))
            .unwrap();
        assert_eq!((b.line, b.col), (2, 3));
        assert_eq!(stream.eof_line, 2);
    }
}
