use dmut_sql::{Digest, LexError, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("mutation {mutation:?}: {source}")]
    AutoDown {
        mutation: String,
        #[source]
        source: ParseError,
    },

    #[error("duplicate mutation name {0:?}")]
    DuplicateName(String),

    #[error("mutation {name:?} has the same hash as an existing mutation ({hash})")]
    DuplicateHash { name: String, hash: Digest },

    #[error("mutation {mutation:?} depends on unknown mutation {dependency:?}")]
    UnknownDependency {
        mutation: String,
        dependency: String,
    },

    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("error in statement {statement:?}: {message}")]
    DbExec { statement: String, message: String },

    #[error("could not install the bookkeeping schema: {0}")]
    Bootstrap(String),

    #[error("verification of {mutation:?} failed during {phase}: {source}")]
    VerificationFailed {
        mutation: String,
        phase: VerifyPhase,
        #[source]
        source: Box<Error>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Which verification property failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// Applying a mutation with its ancestors, then undoing them in reverse.
    LeafRoundtrip,
    /// Undoing one mutation's subtree out of the fully applied set.
    FullDowning,
    /// Replaying the recorded state and reconciling against it.
    UpgradeRehearsal,
}

impl std::fmt::Display for VerifyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VerifyPhase::LeafRoundtrip => "leaf roundtrip",
            VerifyPhase::FullDowning => "full-set downing",
            VerifyPhase::UpgradeRehearsal => "upgrade rehearsal",
        })
    }
}
