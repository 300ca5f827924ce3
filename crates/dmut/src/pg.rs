//! The PostgreSQL runner.
//!
//! Owns one connection. Transaction control runs over the simple query
//! protocol (`BEGIN`, `SAVEPOINT …`), mirroring what the engine asks for:
//! nothing here decides transaction boundaries, the orchestrator does.

use dmut_sql::{Digest, quote_ident};
use indexmap::IndexSet;
use tokio_postgres::{Client, Config, NoTls, Row};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::mutation::{Mutation, MutationMap};
use crate::runner::Runner;
use crate::{Error, Result};

/// Name of the throwaway verification database. A single-writer resource:
/// concurrent invocations race on it.
pub const TEST_DATABASE: &str = "__dmut_test__";

const BOOKKEEPING: &str = "\
CREATE SCHEMA IF NOT EXISTS dmut;
CREATE TABLE IF NOT EXISTS dmut.mutations (
    hash TEXT PRIMARY KEY,
    name TEXT,
    meta BOOLEAN,
    up TEXT[],
    down TEXT[],
    children TEXT[],
    parents TEXT[],
    ts TIMESTAMPTZ DEFAULT NOW()
);
CREATE TABLE IF NOT EXISTS dmut.roles (
    rolname TEXT PRIMARY KEY
);";

pub struct PgRunner {
    client: Client,
    config: Config,
    cancel: CancellationToken,
}

impl PgRunner {
    /// Connect and make sure the bookkeeping schema exists. The token is
    /// checked before every statement; cancelling it makes the current
    /// operation fail, which rolls the outer transaction back.
    pub async fn connect(url: &str, cancel: CancellationToken) -> Result<Self> {
        let config: Config = url.parse()?;
        Self::connect_with(config, cancel).await
    }

    async fn connect_with(config: Config, cancel: CancellationToken) -> Result<Self> {
        tracing::debug!(dbname = ?config.get_dbname(), "connecting");
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection error");
            }
        });

        let mut runner = Self {
            client,
            config,
            cancel,
        };
        runner.install_bookkeeping().await?;
        Ok(runner)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn execute_params(
        &mut self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64> {
        self.check_cancelled()?;
        let span = tracing::debug_span!("dmut.execute", sql = %sql, params = params.len());
        self.client
            .execute(sql, params)
            .instrument(span)
            .await
            .map_err(|err| exec_error(sql, err))
    }

    /// Whether the bookkeeping table carries `column`. Older installations
    /// predate some columns; readers fall back instead of failing.
    async fn has_column(&mut self, column: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.columns
                    WHERE table_schema = 'dmut'
                      AND table_name = 'mutations'
                      AND column_name = $1
                )",
                &[&column],
            )
            .await?;
        Ok(row.get(0))
    }
}

/// Fold the server's detail into the message; it usually names the exact
/// object the statement tripped over.
fn exec_error(sql: &str, err: tokio_postgres::Error) -> Error {
    let message = match err.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({detail})", db.message()),
            None => db.message().to_string(),
        },
        None => err.to_string(),
    };
    Error::DbExec {
        statement: sql.to_string(),
        message,
    }
}

fn mutation_from_row(row: &Row) -> Mutation {
    let text_array = |name: &str| -> Vec<String> {
        row.try_get::<_, Option<Vec<String>>>(name)
            .ok()
            .flatten()
            .unwrap_or_default()
    };
    let hashes = |name: &str| text_array(name).into_iter().map(Digest::from).collect();

    Mutation {
        hash: Digest::from(row.get::<_, String>("hash")),
        name: row
            .try_get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_default(),
        file: None,
        meta: row
            .try_get::<_, Option<bool>>("meta")
            .ok()
            .flatten()
            .unwrap_or(false),
        up: text_array("up"),
        down: text_array("down"),
        children: hashes("children"),
        parents: hashes("parents"),
    }
}

impl Runner for PgRunner {
    type Test = PgRunner;

    async fn exec(&mut self, sql: &str) -> Result<()> {
        self.check_cancelled()?;
        let span = tracing::debug_span!("dmut.exec", sql = %sql);
        self.client
            .batch_execute(sql)
            .instrument(span)
            .await
            .map_err(|err| exec_error(sql, err))
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            self.exec("BEGIN").await
        } else {
            self.exec(&format!("SAVEPOINT {name}")).await
        }
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            self.exec("ROLLBACK").await
        } else {
            self.exec(&format!("ROLLBACK TO SAVEPOINT {name}")).await
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.exec("COMMIT").await
    }

    async fn install_bookkeeping(&mut self) -> Result<()> {
        self.client
            .batch_execute(BOOKKEEPING)
            .await
            .map_err(|err| Error::Bootstrap(err.to_string()))
    }

    async fn applied_mutations(&mut self) -> Result<MutationMap> {
        self.check_cancelled()?;
        // ts postdates the first bookkeeping layout; order by hash alone
        // when it is missing.
        let order = if self.has_column("ts").await? {
            "ORDER BY ts, hash"
        } else {
            "ORDER BY hash"
        };
        let sql = format!("SELECT * FROM dmut.mutations {order}");
        let rows = self
            .client
            .query(sql.as_str(), &[])
            .await
            .map_err(|err| exec_error(&sql, err))?;

        let mut map = MutationMap::new();
        for row in &rows {
            map.add(mutation_from_row(row))?;
        }
        Ok(map)
    }

    async fn save_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        let children: Vec<String> = mutation
            .children
            .iter()
            .map(|h| h.as_str().to_string())
            .collect();
        let parents: Vec<String> = mutation
            .parents
            .iter()
            .map(|h| h.as_str().to_string())
            .collect();
        self.execute_params(
            "INSERT INTO dmut.mutations (hash, name, meta, up, down, children, parents)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &mutation.hash.as_str(),
                &mutation.name,
                &mutation.meta,
                &mutation.up,
                &mutation.down,
                &children,
                &parents,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_mutation(&mut self, hash: &Digest) -> Result<()> {
        self.execute_params(
            "DELETE FROM dmut.mutations WHERE hash = $1",
            &[&hash.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn clear_mutations(&mut self) -> Result<()> {
        self.execute_params("DELETE FROM dmut.mutations", &[]).await?;
        Ok(())
    }

    async fn reconcile_roles(&mut self, target: &IndexSet<String>, reset: bool) -> Result<()> {
        if reset {
            self.exec("TRUNCATE dmut.roles").await?;
        }

        let rows = self
            .client
            .query("SELECT rolname FROM dmut.roles", &[])
            .await?;
        let recorded: IndexSet<String> = rows.iter().map(|r| r.get(0)).collect();

        let missing: Vec<&String> = target.iter().filter(|r| !recorded.contains(*r)).collect();
        let leftover: Vec<&String> = recorded.iter().filter(|r| !target.contains(*r)).collect();

        if !leftover.is_empty() {
            // Grants referencing a role must go before the role does.
            let mutations = self.applied_mutations().await?;
            for mutation in mutations.mutations_in_order(false, &[]) {
                if mutation.meta {
                    self.undo_mutation(&mutation).await?;
                }
            }
            for role in leftover {
                tracing::info!(role = %role, "dropping role");
                self.exec(&format!("DROP ROLE {}", quote_ident(role))).await?;
                self.execute_params("DELETE FROM dmut.roles WHERE rolname = $1", &[role])
                    .await?;
            }
        }

        for role in missing {
            tracing::info!(role = %role, "creating role");
            self.exec(&format!("CREATE ROLE {}", quote_ident(role))).await?;
            self.execute_params("INSERT INTO dmut.roles (rolname) VALUES ($1)", &[role])
                .await?;
        }

        Ok(())
    }

    /// Drop and recreate the verification database, then connect to it.
    /// Must run outside any transaction on this connection.
    async fn test_runner(&mut self) -> Result<PgRunner> {
        self.exec(&format!("DROP DATABASE IF EXISTS {TEST_DATABASE}"))
            .await
            .map_err(bootstrap)?;
        self.exec(&format!("CREATE DATABASE {TEST_DATABASE}"))
            .await
            .map_err(bootstrap)?;

        let mut config = self.config.clone();
        config.dbname(TEST_DATABASE);
        Self::connect_with(config, self.cancel.clone()).await
    }
}

fn bootstrap(err: Error) -> Error {
    match err {
        Error::Cancelled => Error::Cancelled,
        err => Error::Bootstrap(err.to_string()),
    }
}
