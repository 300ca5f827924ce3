//! The database capability surface the engine runs against.
//!
//! Everything the reconciler, verifier and orchestrator do goes through this
//! trait, so the engine itself never touches a connection type. The empty
//! savepoint name addresses the outer transaction: `savepoint("")` begins
//! it, `rollback_to_savepoint("")` aborts it.

use dmut_sql::Digest;
use indexmap::IndexSet;

use crate::mutation::{Mutation, MutationMap};
use crate::Result;

pub trait Runner {
    /// The runner type used for verification against a throwaway database.
    type Test: Runner;

    /// Execute one SQL statement. Must honor cancellation between
    /// statements and preserve server detail on failure.
    async fn exec(&mut self, sql: &str) -> Result<()>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;

    /// Create the bookkeeping schema when absent.
    async fn install_bookkeeping(&mut self) -> Result<()>;

    /// The mutation set the database last recorded, in a stable order.
    async fn applied_mutations(&mut self) -> Result<MutationMap>;
    async fn save_mutation(&mut self, mutation: &Mutation) -> Result<()>;
    async fn delete_mutation(&mut self, hash: &Digest) -> Result<()>;
    async fn clear_mutations(&mut self) -> Result<()>;

    /// Align database roles with `target`: create the missing, drop the
    /// surplus — undoing every recorded meta mutation first, so no grant
    /// still references a role being dropped. `reset` discards the recorded
    /// role set before comparing.
    async fn reconcile_roles(&mut self, target: &IndexSet<String>, reset: bool) -> Result<()>;

    /// Provision the throwaway sibling database and connect to it.
    async fn test_runner(&mut self) -> Result<Self::Test>;

    async fn begin(&mut self) -> Result<()> {
        self.savepoint("").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.rollback_to_savepoint("").await
    }

    /// Run `up` front to back, then record the mutation.
    async fn apply_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        tracing::info!(mutation = %mutation.name, layer = mutation.layer(), "apply");
        for stmt in &mutation.up {
            self.exec(stmt).await?;
        }
        self.save_mutation(mutation).await
    }

    /// Run `down` front to back, then forget the mutation.
    async fn undo_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        tracing::info!(mutation = %mutation.name, layer = mutation.layer(), "undo");
        for stmt in &mutation.down {
            self.exec(stmt).await?;
        }
        self.delete_mutation(&mutation.hash).await
    }
}
