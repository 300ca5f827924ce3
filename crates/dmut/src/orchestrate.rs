//! The full apply cycle.
//!
//! Composition order matters: the throwaway database is provisioned before
//! the primary's transaction opens (database creation cannot run inside
//! one), roles are reconciled first so grants can reference them, and every
//! verification happens against the clone before the primary sees the diff.
//!
//! No advisory lock is taken: two concurrent runs against one database race
//! on the bookkeeping schema and on the test database name. Serialize
//! invocations externally.

use crate::load::Loaded;
use crate::reconcile::{adopt, reconcile};
use crate::runner::Runner;
use crate::verify::{rehearse_upgrade, verify_downings, verify_roundtrips};
use crate::Result;

/// Flags steering one apply cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Rehearse the upgrade and run the verification properties against a
    /// cloned database before touching the primary.
    pub test_before: bool,
    /// Commit at the end. When false the whole cycle runs and is then
    /// rolled back: a dry run.
    pub commit: bool,
    /// Record every declared mutation as applied without executing any of
    /// them, for adopting a database whose schema already exists. Also
    /// resets the recorded role set before reconciling roles.
    pub override_existing: bool,
}

/// Reconcile `loaded` into the database behind `runner`.
///
/// Everything between begin and commit on the primary is one transaction;
/// any error rolls it back and nothing escapes. The test runner's
/// transactions are always rolled back.
pub async fn apply_all<R: Runner>(
    runner: &mut R,
    loaded: &Loaded,
    opts: &ApplyOptions,
) -> Result<()> {
    let mut test = if opts.test_before {
        Some(runner.test_runner().await?)
    } else {
        None
    };

    let outcome = cycle(runner, test.as_mut(), loaded, opts).await;

    match outcome {
        Ok(()) if opts.commit => runner.commit().await,
        Ok(()) => {
            tracing::info!("dry run, rolling back");
            runner.rollback().await
        }
        Err(err) => {
            if let Err(rollback_err) = runner.rollback().await {
                tracing::error!(error = %rollback_err, "rollback after failure also failed");
            }
            Err(err)
        }
    }
}

async fn cycle<R: Runner>(
    runner: &mut R,
    test: Option<&mut R::Test>,
    loaded: &Loaded,
    opts: &ApplyOptions,
) -> Result<()> {
    runner.begin().await?;
    runner
        .reconcile_roles(&loaded.roles, opts.override_existing)
        .await?;

    if let Some(test) = test {
        test.begin().await?;
        let rehearsed = rehearse_upgrade(test, runner, &loaded.mutations).await;
        test.rollback().await?;
        rehearsed?;

        test.begin().await?;
        let verified = match verify_roundtrips(test, &loaded.mutations).await {
            Ok(()) => verify_downings(test).await,
            Err(err) => Err(err),
        };
        test.rollback().await?;
        verified?;
    }

    if opts.override_existing {
        adopt(runner, &loaded.mutations).await
    } else {
        reconcile(runner, &loaded.mutations).await
    }
}
