//! Reconciling the declared set against the recorded set.
//!
//! The database is not migrated along a ledger; it is diffed. Records whose
//! hash no longer exists on disk are defunct and get undone together with
//! everything that depends on them, children first. Whatever is then on disk
//! but not in the database gets applied, parents first. A mutation whose
//! body changed therefore re-applies automatically: its old hash is defunct,
//! its new hash is fresh, and its descendants ride along.

use dmut_sql::Digest;

use crate::mutation::MutationMap;
use crate::runner::Runner;
use crate::Result;

/// Diff `disk` against the database and perform the necessary undos and
/// applies. Must run inside the caller's transaction.
pub async fn reconcile<R: Runner>(runner: &mut R, disk: &MutationMap) -> Result<()> {
    let mut db = runner.applied_mutations().await?;

    let defunct: Vec<Digest> = db.unique_hashes(disk).into_iter().collect();
    tracing::debug!(
        recorded = db.len(),
        declared = disk.len(),
        defunct = defunct.len(),
        "reconciling"
    );

    for mutation in db.mutations_in_order(false, &defunct) {
        runner.undo_mutation(&mutation).await?;
        db.remove(&mutation.hash);
    }

    // Only what the (now reduced) database is missing gets executed. The
    // parents-first walk still visits already-recorded ancestors so the
    // order is right, but they are never touched.
    let fresh = disk.unique_hashes(&db);
    let seeds: Vec<Digest> = fresh.iter().cloned().collect();
    for mutation in disk.mutations_in_order(true, &seeds) {
        if !fresh.contains(&mutation.hash) {
            continue;
        }
        runner.apply_mutation(&mutation).await?;
    }

    Ok(())
}

/// Record every disk mutation as applied without executing anything, for
/// adopting a database whose schema already exists.
pub async fn adopt<R: Runner>(runner: &mut R, disk: &MutationMap) -> Result<()> {
    tracing::info!(declared = disk.len(), "adopting existing database");
    runner.clear_mutations().await?;
    for mutation in disk.mutations_in_order(true, &[]) {
        runner.save_mutation(&mutation).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{MutationDeclaration, load};
    use crate::testing::MemoryRunner;

    fn decl(name: &str, needs: &[&str]) -> MutationDeclaration {
        let mut d = MutationDeclaration::new(name)
            .sql(format!("CREATE TABLE {} (id int);", name.replace('.', "_")).as_str());
        for n in needs {
            d = d.needs(*n);
        }
        d
    }

    fn disk(decls: &[MutationDeclaration]) -> MutationMap {
        load(decls).unwrap().mutations
    }

    #[tokio::test]
    async fn test_empty_database_applies_everything_parents_first() {
        let disk = disk(&[decl("a", &[]), decl("b", &["a"]), decl("c", &["b"])]);
        let mut runner = MemoryRunner::default();

        reconcile(&mut runner, &disk).await.unwrap();

        assert_eq!(runner.applied().len(), 3);
        assert_eq!(
            runner.executed,
            [
                "CREATE TABLE a (id int);",
                "CREATE TABLE b (id int);",
                "CREATE TABLE c (id int);"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_disk_undoes_everything_children_first() {
        let full = disk(&[decl("a", &[]), decl("b", &["a"]), decl("c", &["b"])]);
        let mut runner = MemoryRunner::default();
        reconcile(&mut runner, &full).await.unwrap();
        runner.executed.clear();

        reconcile(&mut runner, &MutationMap::new()).await.unwrap();

        assert!(runner.applied().is_empty());
        assert_eq!(
            runner.executed,
            [
                "DROP TABLE c;",
                "DROP TABLE b;",
                "DROP TABLE a;"
            ]
        );
    }

    #[tokio::test]
    async fn test_second_reconciliation_is_a_noop() {
        let disk = disk(&[decl("a", &[]), decl("b", &["a"])]);
        let mut runner = MemoryRunner::default();
        reconcile(&mut runner, &disk).await.unwrap();
        runner.executed.clear();

        reconcile(&mut runner, &disk).await.unwrap();

        assert!(runner.executed.is_empty(), "{:?}", runner.executed);
    }

    #[tokio::test]
    async fn test_changed_mutation_reapplies_its_subtree_only() {
        let v1 = disk(&[decl("a", &[]), decl("b", &["a"]), decl("c", &["b"])]);
        let mut runner = MemoryRunner::default();
        reconcile(&mut runner, &v1).await.unwrap();
        runner.executed.clear();

        // b's body changes; a and c stay identical on disk.
        let v2 = disk(&[
            decl("a", &[]),
            MutationDeclaration::new("b")
                .needs("a")
                .sql("CREATE TABLE b (id int, extra text);"),
            decl("c", &["b"]),
        ]);

        reconcile(&mut runner, &v2).await.unwrap();

        // c and old b come down children-first, new b and c go up
        // parents-first. Nothing touches a.
        assert_eq!(
            runner.executed,
            [
                "DROP TABLE c;",
                "DROP TABLE b;",
                "CREATE TABLE b (id int, extra text);",
                "CREATE TABLE c (id int);"
            ]
        );
        assert_eq!(runner.applied().len(), 3);
    }

    #[tokio::test]
    async fn test_undoing_sql_parent_takes_meta_child_down() {
        let with_meta = &[MutationDeclaration::new("t")
            .role("r")
            .sql("CREATE TABLE t (id int);")
            .meta("GRANT SELECT ON t TO r;")];
        let mut runner = MemoryRunner::default();
        reconcile(&mut runner, &disk(with_meta)).await.unwrap();
        assert_eq!(runner.applied().len(), 2);
        runner.executed.clear();

        reconcile(&mut runner, &MutationMap::new()).await.unwrap();

        // The meta child is revoked before its sql parent drops.
        assert_eq!(
            runner.executed,
            ["REVOKE SELECT ON t FROM r;", "DROP TABLE t;"]
        );
    }

    #[tokio::test]
    async fn test_adopt_records_without_executing() {
        let disk = disk(&[decl("a", &[]), decl("b", &["a"])]);
        let mut runner = MemoryRunner::default();

        adopt(&mut runner, &disk).await.unwrap();

        assert_eq!(runner.applied().len(), 2);
        assert!(runner.executed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_stops_the_run() {
        let disk = disk(&[decl("a", &[]), decl("b", &["a"])]);
        let mut runner = MemoryRunner::default();
        runner.fail_on = Some("CREATE TABLE b".into());

        let err = reconcile(&mut runner, &disk).await.unwrap_err();
        assert!(matches!(err, crate::Error::DbExec { ref statement, .. }
            if statement.contains("CREATE TABLE b")));
        // a went through, b did not get recorded.
        assert_eq!(runner.applied().len(), 1);
    }
}
