//! SQL-aware plumbing for dmut: tokenizing, content digests and automatic
//! undo derivation.
//!
//! Mutations are identified by a hash over their normalized token stream, so
//! this crate owns the one lexer that everything else must agree with: the
//! digest, the undo grammar and any identifier comparison. Keeping it
//! dependency-light means the engine crate can pull it in from anywhere.

mod autodown;
pub mod combinator;
mod digest;
mod lex;

pub use autodown::{ParseError, derive_down};
pub use digest::{Digest, DigestBuffer};
pub use lex::{LexError, Token, TokenKind, ident_eq, lex, lex_significant};

/// Quote a PostgreSQL identifier.
///
/// Always quotes to sidestep reserved words (`user`, `order`, `group`).
/// Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
