#![allow(async_fn_in_trait)]

//! Declarative, content-addressed schema mutations for PostgreSQL.
//!
//! Instead of a linear ledger of migrations, you declare a *set* of named
//! mutations, each with forward and reverse SQL and its dependencies. Every
//! mutation is identified by a digest over its normalized statement text;
//! the engine diffs the declared set against what the database last
//! recorded, undoes stale records children-first and applies new ones
//! parents-first. Editing a mutation is enough to get it (and everything
//! depending on it) redone, while untouched siblings stay untouched.
//!
//! Reverse statements are derived automatically for the common DDL
//! vocabulary (see [`derive_down`]); anything else takes an explicit down.
//!
//! ```ignore
//! let loaded = dmut::load(&declarations)?;
//! let mut runner = dmut::PgRunner::connect(&url, CancellationToken::new()).await?;
//! dmut::apply_all(
//!     &mut runner,
//!     &loaded,
//!     &dmut::ApplyOptions { test_before: true, commit: true, ..Default::default() },
//! )
//! .await?;
//! ```
//!
//! The cycle behind [`apply_all`]: provision a throwaway clone, open a
//! transaction on the primary, reconcile roles, rehearse the upgrade and
//! the verification properties against the clone, reconcile the primary,
//! commit. Any failure rolls the primary back.

mod error;
mod load;
mod mutation;
mod orchestrate;
mod pg;
mod reconcile;
mod runner;
#[cfg(test)]
mod testing;
mod verify;

pub use error::{Error, VerifyPhase};
pub use load::{Loaded, MutationDeclaration, StatementDecl, load};
pub use mutation::{Mutation, MutationMap, compute_hash};
pub use orchestrate::{ApplyOptions, apply_all};
pub use pg::{PgRunner, TEST_DATABASE};
pub use reconcile::{adopt, reconcile};
pub use runner::Runner;
pub use verify::{rehearse_upgrade, verify_downings, verify_roundtrips};

// The pieces of dmut-sql that callers regularly need alongside the engine.
pub use dmut_sql::{Digest, ParseError, derive_down};

/// Result type for dmut operations.
pub type Result<T> = std::result::Result<T, Error>;
