//! Property checks that run against a throwaway database before the real
//! one is touched.
//!
//! Three rehearsals, all framed by save-points so each case starts from the
//! same state:
//!
//! 1. every mutation applies on top of its ancestors and undoes cleanly in
//!    reverse, starting from an empty database;
//! 2. with the full set applied, every mutation's subtree can be undone on
//!    its own, children first;
//! 3. the primary's recorded state can be replayed and then reconciled to
//!    the declared set.
//!
//! A failure anywhere aborts the run before the primary database sees a
//! single statement of the diff.

use crate::error::VerifyPhase;
use crate::mutation::MutationMap;
use crate::reconcile::reconcile;
use crate::runner::Runner;
use crate::{Error, Result};

const ROUNDTRIP_SAVEPOINT: &str = "dmut_verify_roundtrip";
const DOWNING_SAVEPOINT: &str = "dmut_verify_downing";

fn failed(subject: &str, phase: VerifyPhase, source: Error) -> Error {
    match source {
        Error::Cancelled => Error::Cancelled,
        source => Error::VerificationFailed {
            mutation: subject.to_string(),
            phase,
            source: Box::new(source),
        },
    }
}

/// Apply-then-undo every mutation against an empty database, and leave the
/// full set applied for [`verify_downings`].
pub async fn verify_roundtrips<R: Runner>(runner: &mut R, disk: &MutationMap) -> Result<()> {
    runner.savepoint(ROUNDTRIP_SAVEPOINT).await?;

    for target in disk.iter() {
        tracing::debug!(mutation = %target.name, layer = target.layer(), "roundtrip");
        let chain = disk.mutations_in_order(true, std::slice::from_ref(&target.hash));
        roundtrip(runner, &chain)
            .await
            .map_err(|e| failed(&target.name, VerifyPhase::LeafRoundtrip, e))?;
        runner.rollback_to_savepoint(ROUNDTRIP_SAVEPOINT).await?;
    }

    for mutation in disk.mutations_in_order(true, &[]) {
        runner
            .apply_mutation(&mutation)
            .await
            .map_err(|e| failed(&mutation.name, VerifyPhase::LeafRoundtrip, e))?;
    }
    Ok(())
}

async fn roundtrip<R: Runner>(runner: &mut R, chain: &[crate::Mutation]) -> Result<()> {
    for mutation in chain {
        runner.apply_mutation(mutation).await?;
    }
    for mutation in chain.iter().rev() {
        runner.undo_mutation(mutation).await?;
    }
    Ok(())
}

/// With everything applied, undo each mutation's subtree on its own.
/// Catches down statements that only work in the order the full teardown
/// happens to take.
pub async fn verify_downings<R: Runner>(runner: &mut R) -> Result<()> {
    runner.savepoint(DOWNING_SAVEPOINT).await?;

    let applied = runner.applied_mutations().await?;
    for target in applied.iter() {
        tracing::debug!(mutation = %target.name, layer = target.layer(), "downing");
        let subtree = applied.mutations_in_order(false, std::slice::from_ref(&target.hash));
        for mutation in &subtree {
            runner
                .undo_mutation(mutation)
                .await
                .map_err(|e| failed(&target.name, VerifyPhase::FullDowning, e))?;
        }
        runner.rollback_to_savepoint(DOWNING_SAVEPOINT).await?;
    }
    Ok(())
}

/// Replay the primary's recorded mutations onto the test runner, then run
/// the real reconciliation against it. Errors surface here instead of
/// halfway through the primary's transaction.
pub async fn rehearse_upgrade<T: Runner, P: Runner>(
    test: &mut T,
    primary: &mut P,
    disk: &MutationMap,
) -> Result<()> {
    let recorded = primary.applied_mutations().await?;
    tracing::debug!(recorded = recorded.len(), "rehearsing upgrade");

    for mutation in recorded.mutations_in_order(true, &[]) {
        test.apply_mutation(&mutation)
            .await
            .map_err(|e| failed(&mutation.name, VerifyPhase::UpgradeRehearsal, e))?;
    }

    reconcile(test, disk)
        .await
        .map_err(|e| failed("reconciliation", VerifyPhase::UpgradeRehearsal, e))
}
