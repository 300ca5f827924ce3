//! Content addressing for mutations.
//!
//! A mutation is identified by a SHA-256 digest over the token stream of its
//! name and statements, so reformatting a statement (whitespace, comments,
//! indentation) does not change its identity, while touching a string
//! literal or a dollar-quoted body does.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest as _, Sha256};

use crate::lex::{LexError, lex_significant};

/// A mutation hash: standard base64 of a SHA-256 sum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Digest(s)
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Digest(s.to_string())
    }
}

/// Accumulates whitespace-normalized statements and hashes them.
///
/// Every significant token contributes its text plus a single trailing space
/// byte. The resulting stream is what gets hashed, so the encoding is stable
/// across implementations as long as the lexer agrees.
#[derive(Default)]
pub struct DigestBuffer {
    buf: Vec<u8>,
}

impl DigestBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    /// Lex `stmt` and append its significant tokens.
    pub fn add_statement(&mut self, stmt: &str) -> Result<(), LexError> {
        for token in lex_significant(stmt)? {
            self.buf.extend_from_slice(token.value.as_bytes());
            self.buf.push(b' ');
        }
        Ok(())
    }

    pub fn add_statements<'a>(
        &mut self,
        stmts: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), LexError> {
        for stmt in stmts {
            self.add_statement(stmt)?;
        }
        Ok(())
    }

    /// SHA-256 of everything added so far, as standard base64.
    pub fn finish(&self) -> Digest {
        Digest(STANDARD.encode(Sha256::digest(&self.buf)))
    }

    /// The normalized byte stream itself, useful for debugging hash
    /// mismatches.
    pub fn normalized(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digest_of(stmts: &[&str]) -> Digest {
        let mut buf = DigestBuffer::new();
        buf.add_statements(stmts.iter().copied()).unwrap();
        buf.finish()
    }

    #[test]
    fn test_whitespace_does_not_matter() {
        assert_eq!(
            digest_of(&["CREATE   TABLE\tfoo(id int);"]),
            digest_of(&["CREATE TABLE foo (id int);"])
        );
    }

    #[test]
    fn test_comments_do_not_matter() {
        assert_eq!(
            digest_of(&["CREATE TABLE foo (id int); -- the foo table"]),
            digest_of(&["CREATE TABLE /* core */ foo (id int);"])
        );
    }

    #[test]
    fn test_string_contents_matter() {
        assert_ne!(
            digest_of(&["INSERT INTO t VALUES ('a b');"]),
            digest_of(&["INSERT INTO t VALUES ('a  b');"])
        );
    }

    #[test]
    fn test_dollar_quoted_bodies_matter() {
        assert_ne!(
            digest_of(&["CREATE FUNCTION f() AS $$ SELECT 1 $$;"]),
            digest_of(&["CREATE FUNCTION f() AS $$ SELECT  1 $$;"])
        );
    }

    #[test]
    fn test_case_matters() {
        // Normalization collapses whitespace, nothing else: identity is the
        // token text as written.
        assert_ne!(
            digest_of(&["CREATE TABLE foo (id int);"]),
            digest_of(&["create table foo (id int);"])
        );
    }

    #[test]
    fn test_statement_boundaries_are_flattened_in_order() {
        // The stream has no per-statement separator, only token order.
        assert_eq!(
            digest_of(&["a b", "c"]),
            digest_of(&["a", "b c"]),
        );
        assert_ne!(digest_of(&["a b", "c"]), digest_of(&["a", "c b"]));
    }

    #[test]
    fn test_normalized_stream_shape() {
        let mut buf = DigestBuffer::new();
        buf.add_statement("CREATE TABLE foo\n  (id int);").unwrap();
        assert_eq!(
            std::str::from_utf8(buf.normalized()).unwrap(),
            "CREATE TABLE foo ( id int ) ; "
        );
    }

    proptest! {
        /// Reflowing a statement with arbitrary whitespace between tokens
        /// never changes its digest.
        #[test]
        fn prop_digest_stable_under_reflow(seps in proptest::collection::vec("[ \t\n]{1,3}", 0..16)) {
            let stmt = "ALTER TABLE t ADD CONSTRAINT ck CHECK (x > 0);";
            let tokens = crate::lex::lex_significant(stmt).unwrap();

            let mut reflowed = String::new();
            let mut seps = seps.into_iter();
            for token in &tokens {
                reflowed.push_str(&token.value);
                reflowed.push_str(seps.next().as_deref().unwrap_or(" "));
            }

            prop_assert_eq!(digest_of(&[stmt]), digest_of(&[reflowed.as_str()]));
        }
    }
}
