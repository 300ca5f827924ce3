//! An in-memory [`Runner`] for engine tests.
//!
//! Statements are logged, not interpreted: bookkeeping writes and role
//! changes mutate a snapshot-able state, so save-points and rollbacks
//! behave like the real thing while the schema itself stays imaginary.
//! Failures are injected by statement substring.

use dmut_sql::{Digest, quote_ident};
use indexmap::IndexSet;

use crate::mutation::{Mutation, MutationMap};
use crate::runner::Runner;
use crate::{Error, Result};

#[derive(Debug, Default, Clone)]
struct DbState {
    mutations: MutationMap,
    roles: IndexSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryRunner {
    state: DbState,
    savepoints: Vec<(String, DbState)>,
    /// Every statement that ran, in order. Rollbacks do not unlog.
    pub executed: Vec<String>,
    /// Fail any statement containing this substring.
    pub fail_on: Option<String>,
    /// `fail_on` for runners returned by [`Runner::test_runner`].
    pub test_fail_on: Option<String>,
    pub committed: bool,
    pub cancelled: bool,
}

impl MemoryRunner {
    pub fn applied(&self) -> &MutationMap {
        &self.state.mutations
    }

    pub fn roles(&self) -> &IndexSet<String> {
        &self.state.roles
    }
}

impl Runner for MemoryRunner {
    type Test = MemoryRunner;

    async fn exec(&mut self, sql: &str) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(Error::DbExec {
                    statement: sql.to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        self.executed.push(sql.to_string());
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.state.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let Some(index) = self.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Err(Error::DbExec {
                statement: format!("ROLLBACK TO SAVEPOINT {name}"),
                message: "no such savepoint".to_string(),
            });
        };
        self.state = self.savepoints[index].1.clone();
        // A named save-point survives its own rollback; the transaction
        // itself does not.
        let keep = if name.is_empty() { index } else { index + 1 };
        self.savepoints.truncate(keep);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.committed = true;
        self.savepoints.clear();
        Ok(())
    }

    async fn install_bookkeeping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn applied_mutations(&mut self) -> Result<MutationMap> {
        Ok(self.state.mutations.clone())
    }

    async fn save_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        self.state.mutations.add(mutation.clone())
    }

    async fn delete_mutation(&mut self, hash: &Digest) -> Result<()> {
        self.state.mutations.remove(hash);
        Ok(())
    }

    async fn clear_mutations(&mut self) -> Result<()> {
        self.state.mutations = MutationMap::new();
        Ok(())
    }

    async fn reconcile_roles(&mut self, target: &IndexSet<String>, reset: bool) -> Result<()> {
        if reset {
            self.state.roles.clear();
        }
        let missing: Vec<String> = target
            .iter()
            .filter(|r| !self.state.roles.contains(*r))
            .cloned()
            .collect();
        let leftover: Vec<String> = self
            .state
            .roles
            .iter()
            .filter(|r| !target.contains(*r))
            .cloned()
            .collect();

        if !leftover.is_empty() {
            let recorded = self.state.mutations.clone();
            for mutation in recorded.mutations_in_order(false, &[]) {
                if mutation.meta {
                    self.undo_mutation(&mutation).await?;
                }
            }
            for role in &leftover {
                self.exec(&format!("DROP ROLE {}", quote_ident(role))).await?;
                self.state.roles.swap_remove(role);
            }
        }
        for role in missing {
            self.exec(&format!("CREATE ROLE {}", quote_ident(&role))).await?;
            self.state.roles.insert(role);
        }
        Ok(())
    }

    async fn test_runner(&mut self) -> Result<Self::Test> {
        Ok(MemoryRunner {
            fail_on: self.test_fail_on.clone(),
            ..MemoryRunner::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{MutationDeclaration, load};
    use crate::reconcile::reconcile;

    #[tokio::test]
    async fn test_savepoint_rollback_restores_state() {
        let mut runner = MemoryRunner::default();
        let m = Mutation::new("m", false, vec!["CREATE TABLE t (id int);".into()], vec![])
            .unwrap();

        runner.begin().await.unwrap();
        runner.savepoint("sp").await.unwrap();
        runner.apply_mutation(&m).await.unwrap();
        assert_eq!(runner.applied().len(), 1);

        runner.rollback_to_savepoint("sp").await.unwrap();
        assert!(runner.applied().is_empty());

        // The named save-point is still addressable.
        runner.apply_mutation(&m).await.unwrap();
        runner.rollback_to_savepoint("sp").await.unwrap();
        assert!(runner.applied().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_an_error() {
        let mut runner = MemoryRunner::default();
        assert!(runner.rollback_to_savepoint("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_a_role_undoes_meta_mutations_first() {
        let loaded = load(&[MutationDeclaration::new("t")
            .role("reader")
            .sql("CREATE TABLE t (id int);")
            .meta("GRANT SELECT ON t TO reader;")])
        .unwrap();

        let mut runner = MemoryRunner::default();
        runner
            .reconcile_roles(&loaded.roles, false)
            .await
            .unwrap();
        reconcile(&mut runner, &loaded.mutations).await.unwrap();
        runner.executed.clear();

        // The role disappears from the declarations.
        runner
            .reconcile_roles(&IndexSet::new(), false)
            .await
            .unwrap();

        assert_eq!(
            runner.executed,
            ["REVOKE SELECT ON t FROM reader;", "DROP ROLE \"reader\""]
        );
        assert!(runner.roles().is_empty());
        // The sql layer stays recorded; only the meta layer was undone.
        assert_eq!(runner.applied().len(), 1);
        assert!(!runner.applied().iter().next().unwrap().meta);
    }
}
