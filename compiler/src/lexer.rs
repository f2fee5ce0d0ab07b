// Lexer for emitted C++ render procedures.
//
// Tokenizes the C++ subset that `codegen` produces, so the verifier can read
// an artifact back. Uses the `logos` crate for DFA-based lexing. Comments and
// preprocessor lines carry no semantics and are skipped.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Artifact token types.
///
/// Keywords and symbols are matched as fixed strings. Literals carry parsed
/// values. Identifiers carry no value; use the span to retrieve the text.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("static")]
    Static,
    #[token("const")]
    Const,
    #[token("extern")]
    Extern,
    #[token("void")]
    Void,
    #[token("float")]
    Float,
    #[token("int")]
    Int,
    #[token("for")]
    For,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("nullptr")]
    Nullptr,

    // ── Symbols ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("->")]
    Arrow,
    #[token("::")]
    ColonColon,
    #[token("=")]
    Assign,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("&")]
    Amp,
    #[token("++")]
    PlusPlus,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,

    // ── Literals ──
    //
    // Float literals always carry the `f` suffix, so a bare integer never
    // lexes as a float.
    /// `float` literal (e.g. `0.92f`, `-1.5f`, `1e-7f`).
    #[regex(r"-?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?f", parse_float)]
    FloatLit(f32),

    /// Non-negative integer literal (array lengths, loop bounds, offsets).
    #[regex(r"[0-9]+", parse_int)]
    IntLit(usize),

    /// String literal (only `extern "C"` in practice).
    #[regex(r#""[^"\n]*""#, parse_string)]
    StrLit(String),

    // ── Identifier ──
    //
    // Placed after keywords; logos prioritises fixed `#[token]` matches over
    // regex for the same length, so `for` matches For, not Ident.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Static => write!(f, "static"),
            Token::Const => write!(f, "const"),
            Token::Extern => write!(f, "extern"),
            Token::Void => write!(f, "void"),
            Token::Float => write!(f, "float"),
            Token::Int => write!(f, "int"),
            Token::For => write!(f, "for"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::Nullptr => write!(f, "nullptr"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Semi => write!(f, ";"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
            Token::Arrow => write!(f, "->"),
            Token::ColonColon => write!(f, "::"),
            Token::Assign => write!(f, "="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::AndAnd => write!(f, "&&"),
            Token::Amp => write!(f, "&"),
            Token::PlusPlus => write!(f, "++"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::FloatLit(v) => write!(f, "{:?}f", v),
            Token::IntLit(n) => write!(f, "{}", n),
            Token::StrLit(s) => write!(f, "\"{}\"", s),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f32> {
    lex.slice().trim_end_matches('f').parse().ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<usize> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    Some(slice[1..slice.len() - 1].to_string())
}

// ── Public API ──

/// Lex artifact text into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──
