//! Lightweight inspection of GraphQL executable documents.
//!
//! Only what routing and caching need is extracted: the kind, name and
//! top-level fields of the main operation. Nothing is validated against a
//! schema and selection sets below the root are skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of a GraphQL operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "query" => Some(Self::Query),
            "mutation" => Some(Self::Mutation),
            "subscription" => Some(Self::Subscription),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document inspection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DocumentError {
    #[error("document is empty")]
    Empty,

    #[error("document contains no operation definition")]
    NoOperation,

    #[error("operation '{0}' is not defined in the document")]
    UnknownOperation(String),

    #[error("unbalanced '{delimiter}' at byte {offset}")]
    Unbalanced { delimiter: char, offset: usize },

    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),

    #[error("'{0}' is not a valid GraphQL name")]
    InvalidName(String),
}

/// Main operation of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub kind: OperationKind,
    pub name: Option<String>,
    /// Top-level field names (aliases resolved to the field they select).
    /// Fields selected through fragment spreads are not listed.
    pub root_fields: Vec<String>,
}

/// Inspect `source` and describe its main operation.
///
/// The main operation is the one named `operation_name` when given, otherwise
/// the first operation definition. Fragment definitions are never the main
/// operation, wherever they appear.
///
/// # Errors
/// See [`DocumentError`].
pub fn inspect(source: &str, operation_name: Option<&str>) -> Result<DocumentInfo, DocumentError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(DocumentError::Empty);
    }
    check_balance(&tokens)?;

    let operations = definitions(&tokens);
    let main = match operation_name {
        Some(wanted) => operations
            .iter()
            .find(|op| op.name == Some(wanted))
            .ok_or_else(|| DocumentError::UnknownOperation(wanted.to_owned()))?,
        None => operations.first().ok_or(DocumentError::NoOperation)?,
    };

    Ok(DocumentInfo {
        kind: main.kind,
        name: main.name.map(str::to_owned),
        root_fields: root_fields(&tokens[main.selection.0..main.selection.1]),
    })
}

/// Whether `name` matches the GraphQL name grammar `/[_A-Za-z][_0-9A-Za-z]*/`
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b == b'_' || b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b == b'_' || b.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Name(&'a str),
    Punct(u8),
    Spread,
    Literal,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token<'_>)>, DocumentError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            b' ' | b'\t' | b'\n' | b'\r' | b',' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    i += 1;
                }
            }
            b'"' if bytes[i..].starts_with(b"\"\"\"") => {
                i = skip_block_string(bytes, i + 3).ok_or(DocumentError::UnterminatedString(start))?;
                tokens.push((start, Token::Literal));
            }
            b'"' => {
                i = skip_string(bytes, i + 1).ok_or(DocumentError::UnterminatedString(start))?;
                tokens.push((start, Token::Literal));
            }
            b'.' if bytes[i..].starts_with(b"...") => {
                i += 3;
                tokens.push((start, Token::Spread));
            }
            b if b == b'_' || b.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                tokens.push((start, Token::Name(&source[start..i])));
            }
            b if b == b'-' || b.is_ascii_digit() => {
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'.' | b'+' | b'-'))
                {
                    i += 1;
                }
                tokens.push((start, Token::Literal));
            }
            b if b.is_ascii() => {
                i += 1;
                tokens.push((start, Token::Punct(b)));
            }
            // Byte order mark or stray non-ASCII text outside strings
            _ => i += 1,
        }
    }

    Ok(tokens)
}

/// Position just past the closing quote, if there is one on this line
fn skip_string(bytes: &[u8], mut i: usize) -> Option<usize> {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            b'\n' | b'\r' => return None,
            _ => i += 1,
        }
    }
    None
}

fn skip_block_string(bytes: &[u8], mut i: usize) -> Option<usize> {
    while i < bytes.len() {
        if bytes[i..].starts_with(b"\\\"\"\"") {
            i += 4;
        } else if bytes[i..].starts_with(b"\"\"\"") {
            return Some(i + 3);
        } else {
            i += 1;
        }
    }
    None
}

fn closer_of(open: u8) -> u8 {
    match open {
        b'{' => b'}',
        b'(' => b')',
        _ => b']',
    }
}

fn check_balance(tokens: &[(usize, Token<'_>)]) -> Result<(), DocumentError> {
    let mut stack: Vec<(usize, u8)> = Vec::new();
    for &(offset, token) in tokens {
        match token {
            Token::Punct(open @ (b'{' | b'(' | b'[')) => stack.push((offset, open)),
            Token::Punct(close @ (b'}' | b')' | b']')) => match stack.pop() {
                Some((_, open)) if closer_of(open) == close => {}
                _ => {
                    return Err(DocumentError::Unbalanced {
                        delimiter: char::from(close),
                        offset,
                    });
                }
            },
            _ => {}
        }
    }
    match stack.pop() {
        Some((offset, open)) => Err(DocumentError::Unbalanced {
            delimiter: char::from(open),
            offset,
        }),
        None => Ok(()),
    }
}

struct OperationDefinition<'a> {
    kind: OperationKind,
    name: Option<&'a str>,
    /// Token range inside the outer braces of the selection set
    selection: (usize, usize),
}

fn is_open(token: Token<'_>) -> bool {
    matches!(token, Token::Punct(b'{' | b'(' | b'['))
}

fn is_close(token: Token<'_>) -> bool {
    matches!(token, Token::Punct(b'}' | b')' | b']'))
}

/// Index of the token closing the group opened at `open` (balance already checked)
fn matching_close(tokens: &[(usize, Token<'_>)], open: usize) -> usize {
    let mut depth = 0usize;
    for (i, &(_, token)) in tokens.iter().enumerate().skip(open) {
        if is_open(token) {
            depth += 1;
        } else if is_close(token) {
            depth -= 1;
            if depth == 0 {
                return i;
            }
        }
    }
    tokens.len()
}

/// Index of the first `{` at nesting depth zero, starting at `from`
fn next_selection_open(tokens: &[(usize, Token<'_>)], from: usize) -> Option<usize> {
    let mut i = from;
    while i < tokens.len() {
        match tokens[i].1 {
            Token::Punct(b'{') => return Some(i),
            t if is_open(t) => i = matching_close(tokens, i) + 1,
            _ => i += 1,
        }
    }
    None
}

fn definitions<'a>(tokens: &[(usize, Token<'a>)]) -> Vec<OperationDefinition<'a>> {
    let mut operations = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let (kind, name) = match tokens[i].1 {
            Token::Punct(b'{') => (Some(OperationKind::Query), None),
            Token::Name(keyword) => {
                let kind = OperationKind::from_keyword(keyword);
                let name = match (kind, tokens.get(i + 1)) {
                    (Some(_), Some(&(_, Token::Name(name)))) => Some(name),
                    _ => None,
                };
                (kind, name)
            }
            _ => (None, None),
        };

        // Fragments and anything that is not an operation are skipped whole
        let Some(open) = next_selection_open(tokens, i) else {
            break;
        };
        let close = matching_close(tokens, open);
        if let Some(kind) = kind {
            operations.push(OperationDefinition {
                kind,
                name,
                selection: (open + 1, close),
            });
        }
        i = close + 1;
    }

    operations
}

fn root_fields(selection: &[(usize, Token<'_>)]) -> Vec<String> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut skip_names = 0usize;
    let mut i = 0;

    while i < selection.len() {
        let token = selection[i].1;
        if is_open(token) {
            depth += 1;
        } else if is_close(token) {
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            match token {
                Token::Punct(b'@') => skip_names = 1,
                Token::Spread => {
                    skip_names = match selection.get(i + 1) {
                        Some(&(_, Token::Name("on"))) => 2,
                        _ => 1,
                    };
                }
                Token::Name(_) if skip_names > 0 => skip_names -= 1,
                Token::Name(name) => {
                    if let (Some(&(_, Token::Punct(b':'))), Some(&(_, Token::Name(field)))) =
                        (selection.get(i + 1), selection.get(i + 2))
                    {
                        fields.push(field.to_owned());
                        i += 2;
                    } else {
                        fields.push(name.to_owned());
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    fields
}
