//! Query fingerprinting.
//!
//! A fingerprint identifies a class of statements that differ only in their
//! literal values. Statement text is tokenized, literals and bind parameters
//! are replaced with `?`, comments are dropped and keywords are lower-cased.
//! The normalized text is hashed to a stable 64-bit id.
//!
//! Normalization is a pure function and idempotent:
//!
//! ```
//! use collection_engine::domain::fingerprint::{fingerprint, normalize};
//!
//! let a = fingerprint("SELECT * FROM orders WHERE id = 42");
//! let b = fingerprint("select *  from orders where id = 7;");
//! assert_eq!(a, b);
//! assert_eq!(a.normalized(), "select * from orders where id = ?");
//!
//! let once = normalize("UPDATE t SET v = 'x' WHERE k IN (1, 2, 3)");
//! assert_eq!(normalize(&once), once);
//! ```

use std::fmt;
use std::sync::Arc;

use ahash::RandomState;

/// Upper bound on the length, in characters, of normalized statement text
/// carried on a fingerprint.
pub const MAX_NORMALIZED_LEN: usize = 4095;

/// Replacement for every literal.
pub const PLACEHOLDER: &str = "?";

// Fixed seeds keep ids stable across processes built from the same ahash
// release.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Words after which a sign belongs to a following numeric literal.
const PREFIX_KEYWORDS: &[&str] = &[
    "select", "where", "and", "or", "not", "when", "then", "else", "in", "values", "return",
    "like", "between", "limit", "offset", "is", "by", "case", "set", "on", "having",
];

/// Words that are followed by a space before `(`.
const SPACED_KEYWORDS: &[&str] = &[
    "in", "values", "and", "or", "not", "exists", "from", "join", "as", "on", "where", "select",
    "any", "all", "using", "into", "with", "over", "filter", "between", "when", "then", "else",
];

/// Identity of a class of statements that differ only in literal values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    id: u64,
    normalized: Arc<str>,
}

impl Fingerprint {
    /// Fingerprint raw statement text.
    pub fn of(text: &str) -> Self {
        let full = normalize_untruncated(text);
        let id = RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]).hash_one(&full);
        let normalized = truncate(full);
        Self {
            id,
            normalized: Arc::from(normalized),
        }
    }

    /// The 64-bit fingerprint id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The id rendered as 16 lower-case hex digits.
    pub fn hex(&self) -> String {
        format!("{:016x}", self.id)
    }

    /// Normalized statement text, at most [`MAX_NORMALIZED_LEN`] characters.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Leading statement verb, used when a producer supplies no statement
    /// type of its own.
    pub fn statement_type(&self) -> &'static str {
        let first = self
            .normalized
            .split(|c: char| c.is_whitespace() || c == '(')
            .find(|word| !word.is_empty())
            .unwrap_or("");
        match first {
            "select" => "select",
            "insert" => "insert",
            "update" => "update",
            "delete" => "delete",
            "with" => "with",
            "merge" => "merge",
            "copy" => "copy",
            "begin" | "commit" | "rollback" | "savepoint" | "release" => "transaction",
            "create" | "alter" | "drop" | "truncate" => "ddl",
            _ => "other",
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.id)
    }
}

/// Fingerprint raw statement text.
pub fn fingerprint(text: &str) -> Fingerprint {
    Fingerprint::of(text)
}

/// Normalize statement text without hashing it.
pub fn normalize(text: &str) -> String {
    truncate(normalize_untruncated(text))
}

fn normalize_untruncated(text: &str) -> String {
    let tokens = collapse_lists(tokenize(text));
    render(&tokens)
}

fn truncate(mut normalized: String) -> String {
    if let Some((cut, _)) = normalized.char_indices().nth(MAX_NORMALIZED_LEN) {
        normalized.truncate(cut);
        let kept = normalized.trim_end_matches([' ', ';']).len();
        normalized.truncate(kept);
    }
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Keyword or bare identifier, lower-cased.
    Word(String),
    /// Double-quoted identifier, verbatim including quotes.
    Quoted(String),
    /// Any literal or bind parameter.
    Placeholder,
    /// Operator run such as `=`, `<>` or `||`.
    Operator(String),
    /// Structural punctuation.
    Punct(&'static str),
}

impl Token {
    fn as_str(&self) -> &str {
        match self {
            Token::Word(w) => w,
            Token::Quoted(q) => q,
            Token::Placeholder => PLACEHOLDER,
            Token::Operator(op) => op,
            Token::Punct(p) => p,
        }
    }
}

fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '<' | '>' | '=' | '~' | '!' | '@' | '#' | '%' | '^' | '&' | '|'
            | '`'
    )
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn starts_number(chars: &[char], i: usize) -> bool {
    match chars.get(i) {
        Some(c) if c.is_ascii_digit() => true,
        Some('.') => chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// A sign directly before a number is part of the literal when nothing that
/// could be a left operand precedes it.
fn sign_is_unary(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(Token::Operator(_)) => true,
        Some(Token::Punct(p)) => matches!(*p, "(" | "," | "[" | "::"),
        Some(Token::Word(w)) => PREFIX_KEYWORDS.contains(&w.as_str()),
        Some(Token::Quoted(_)) | Some(Token::Placeholder) => false,
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i = skip_block_comment(&chars, i);
            continue;
        }

        if c == '\'' {
            i = skip_string(&chars, i, false);
            tokens.push(Token::Placeholder);
            continue;
        }

        if c == '"' {
            let start = i;
            i = skip_quoted_identifier(&chars, i);
            tokens.push(Token::Quoted(chars[start..i].iter().collect()));
            continue;
        }

        if c == '$' {
            if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(Token::Placeholder);
                continue;
            }
            if let Some(end) = skip_dollar_quoted(&chars, i) {
                i = end;
                tokens.push(Token::Placeholder);
                continue;
            }
            tokens.push(Token::Operator("$".to_string()));
            i += 1;
            continue;
        }

        if c == '?' {
            tokens.push(Token::Placeholder);
            i += 1;
            continue;
        }

        if starts_number(&chars, i) {
            i = skip_number(&chars, i);
            tokens.push(Token::Placeholder);
            continue;
        }

        if (c == '-' || c == '+') && starts_number(&chars, i + 1) && sign_is_unary(tokens.last())
        {
            i = skip_number(&chars, i + 1);
            tokens.push(Token::Placeholder);
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_continue(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect::<String>().to_lowercase();

            // Prefixed string constants: E'..', B'..', X'..', N'..'
            if chars.get(i) == Some(&'\'') && matches!(word.as_str(), "e" | "b" | "x" | "n") {
                i = skip_string(&chars, i, word == "e");
                tokens.push(Token::Placeholder);
                continue;
            }

            tokens.push(Token::Word(word));
            continue;
        }

        match c {
            '(' => tokens.push(Token::Punct("(")),
            ')' => tokens.push(Token::Punct(")")),
            '[' => tokens.push(Token::Punct("[")),
            ']' => tokens.push(Token::Punct("]")),
            ',' => tokens.push(Token::Punct(",")),
            ';' => tokens.push(Token::Punct(";")),
            '.' => tokens.push(Token::Punct(".")),
            ':' => {
                if chars.get(i + 1) == Some(&':') {
                    tokens.push(Token::Punct("::"));
                    i += 1;
                } else {
                    tokens.push(Token::Punct(":"));
                }
            }
            _ if is_operator_char(c) => {
                let start = i;
                i += 1;
                while i < chars.len() && is_operator_char(chars[i]) {
                    let next = chars[i];
                    if (next == '-' && chars.get(i + 1) == Some(&'-'))
                        || (next == '/' && chars.get(i + 1) == Some(&'*'))
                        || ((next == '-' || next == '+') && starts_number(&chars, i + 1))
                    {
                        break;
                    }
                    i += 1;
                }
                tokens.push(Token::Operator(chars[start..i].iter().collect()));
                continue;
            }
            _ => tokens.push(Token::Operator(c.to_string())),
        }
        i += 1;
    }

    while tokens.last() == Some(&Token::Punct(";")) {
        tokens.pop();
    }
    tokens
}

fn skip_block_comment(chars: &[char], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            depth += 1;
            i += 2;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    i
}

/// Skip a single-quoted string starting at `i` (the opening quote).
fn skip_string(chars: &[char], mut i: usize, backslash_escapes: bool) -> usize {
    i += 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if backslash_escapes => i += 2,
            '\'' if chars.get(i + 1) == Some(&'\'') => i += 2,
            '\'' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn skip_quoted_identifier(chars: &[char], mut i: usize) -> usize {
    i += 1;
    while i < chars.len() {
        if chars[i] == '"' {
            if chars.get(i + 1) == Some(&'"') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Skip `$tag$ ... $tag$` starting at `i`. Returns `None` when `i` does not
/// open a dollar-quoted string.
fn skip_dollar_quoted(chars: &[char], i: usize) -> Option<usize> {
    let mut j = i + 1;
    if chars.get(j).is_some_and(|c| is_ident_start(*c)) {
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
    }
    if chars.get(j) != Some(&'$') {
        return None;
    }
    let tag = &chars[i..=j];
    let mut k = j + 1;
    while k + tag.len() <= chars.len() {
        if &chars[k..k + tag.len()] == tag {
            return Some(k + tag.len());
        }
        k += 1;
    }
    Some(chars.len())
}

fn skip_number(chars: &[char], mut i: usize) -> usize {
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        while i < chars.len() && (chars[i].is_ascii_hexdigit() || chars[i] == '_') {
            i += 1;
        }
        return i;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1) != Some(&'.') {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

/// Collapse `(?, ?, ?)` to `(?)`, then repeated `(?), (?)` rows to one.
fn collapse_lists(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == Token::Punct("(") {
            if let Some(end) = placeholder_list_end(&tokens, i) {
                out.extend([Token::Punct("("), Token::Placeholder, Token::Punct(")")]);
                i = end;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }

    let group = [Token::Punct("("), Token::Placeholder, Token::Punct(")")];
    let mut rows: Vec<Token> = Vec::with_capacity(out.len());
    let mut i = 0;
    while i < out.len() {
        rows.push(out[i].clone());
        if rows.ends_with(&group) {
            while out.get(i + 1) == Some(&Token::Punct(","))
                && out.get(i + 2..i + 5) == Some(&group[..])
            {
                i += 4;
            }
        }
        i += 1;
    }
    rows
}

/// If `tokens[open]` starts a list of only placeholders, return the index
/// just past its closing parenthesis.
fn placeholder_list_end(tokens: &[Token], open: usize) -> Option<usize> {
    let mut i = open + 1;
    let mut expect_value = true;
    while let Some(token) = tokens.get(i) {
        match (token, expect_value) {
            (Token::Placeholder, true) => expect_value = false,
            (Token::Punct(","), false) => expect_value = true,
            (Token::Punct(")"), false) => return Some(i + 1),
            _ => return None,
        }
        i += 1;
    }
    None
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;
    for token in tokens {
        if let Some(prev) = prev {
            if needs_space(prev, token) {
                out.push(' ');
            }
        }
        out.push_str(token.as_str());
        prev = Some(token);
    }
    out
}

fn needs_space(prev: &Token, next: &Token) -> bool {
    if matches!(prev, Token::Punct("(" | "[" | "." | "::")) {
        return false;
    }
    match next {
        Token::Punct("," | ")" | "]" | "." | "::" | ";" | "[") => false,
        Token::Punct("(") => match prev {
            Token::Word(w) => SPACED_KEYWORDS.contains(&w.as_str()),
            Token::Quoted(_) => false,
            _ => true,
        },
        _ => true,
    }
}
