//! Turns mutation declarations into the frozen graph.
//!
//! Declarations come from whatever front-end discovered and deserialized
//! them; by the time they reach this module they are plain records. Loading
//! computes hashes, splits each declaration into its sql and meta layers,
//! resolves explicit and hierarchical dependencies and refuses cycles. The
//! resulting map is frozen: reconciliation never mutates records, only the
//! set.

use dmut_sql::{Digest, derive_down};
use indexmap::{IndexMap, IndexSet};

use crate::mutation::{Mutation, MutationMap};
use crate::{Error, Result};

/// One statement of a declaration: either bare SQL whose undo is derived
/// automatically, or an explicit up/down pair.
#[derive(Debug, Clone)]
pub enum StatementDecl {
    Sql(String),
    UpDown { up: String, down: String },
}

impl StatementDecl {
    pub fn up_down(up: impl Into<String>, down: impl Into<String>) -> Self {
        StatementDecl::UpDown {
            up: up.into(),
            down: down.into(),
        }
    }
}

impl From<&str> for StatementDecl {
    fn from(sql: &str) -> Self {
        StatementDecl::Sql(sql.to_string())
    }
}

/// A user-authored mutation declaration.
#[derive(Debug, Clone, Default)]
pub struct MutationDeclaration {
    pub name: String,
    /// Origin path, carried through for diagnostics.
    pub file: Option<String>,
    /// Names of mutations this one depends on.
    pub needs: Vec<String>,
    /// Roles this mutation's statements refer to.
    pub roles: Vec<String>,
    /// Ordinary schema statements.
    pub sql: Vec<StatementDecl>,
    /// Role-dependent statements (grants, ownership), redone on role
    /// changes.
    pub meta: Vec<StatementDecl>,
}

impl MutationDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn needs(mut self, name: impl Into<String>) -> Self {
        self.needs.push(name.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn sql(mut self, stmt: impl Into<StatementDecl>) -> Self {
        self.sql.push(stmt.into());
        self
    }

    pub fn meta(mut self, stmt: impl Into<StatementDecl>) -> Self {
        self.meta.push(stmt.into());
        self
    }
}

/// The loaded, frozen mutation set.
#[derive(Debug, Default)]
pub struct Loaded {
    pub mutations: MutationMap,
    /// Union of every declaration's roles, in declaration order.
    pub roles: IndexSet<String>,
}

#[derive(Default)]
struct Layers {
    sql: Option<Digest>,
    meta: Option<Digest>,
}

/// Ingest declarations into a mutation map.
pub fn load(declarations: &[MutationDeclaration]) -> Result<Loaded> {
    let mut map = MutationMap::new();
    let mut by_name: IndexMap<&str, Layers> = IndexMap::new();
    let mut roles = IndexSet::new();

    // First pass: records and hashes, plus the meta-follows-sql edge.
    for decl in declarations {
        if by_name.contains_key(decl.name.as_str()) {
            return Err(Error::DuplicateName(decl.name.clone()));
        }

        let mut layers = Layers::default();
        for (meta, block) in [(false, &decl.sql), (true, &decl.meta)] {
            let (up, down) = split_statements(&decl.name, block)?;
            let mut record = Mutation::new(&decl.name, meta, up, down)?;
            if let Some(file) = &decl.file {
                record = record.with_file(file);
            }
            if !record.has_statements() {
                continue;
            }
            let hash = record.hash.clone();
            map.add(record)?;
            if meta {
                layers.meta = Some(hash);
            } else {
                layers.sql = Some(hash);
            }
        }

        if let (Some(sql), Some(meta)) = (&layers.sql, &layers.meta) {
            map.link(sql, meta);
        }

        by_name.insert(&decl.name, layers);
        roles.extend(decl.roles.iter().cloned());
    }

    // Second pass: explicit dependencies, mirrored on both layers, then
    // hierarchical parenting by dotted name.
    for decl in declarations {
        let current = &by_name[decl.name.as_str()];
        for need in &decl.needs {
            let Some(target) = by_name.get(need.as_str()) else {
                return Err(Error::UnknownDependency {
                    mutation: decl.name.clone(),
                    dependency: need.clone(),
                });
            };
            link_layers(&mut map, target, current);
        }
        for prefix in dotted_prefixes(&decl.name) {
            if let Some(target) = by_name.get(prefix) {
                link_layers(&mut map, target, current);
            }
        }
    }

    check_cycles(&map)?;

    Ok(Loaded {
        mutations: map,
        roles,
    })
}

fn link_layers(map: &mut MutationMap, parent: &Layers, child: &Layers) {
    if let (Some(p), Some(c)) = (&parent.sql, &child.sql) {
        map.link(p, c);
    }
    if let (Some(p), Some(c)) = (&parent.meta, &child.meta) {
        map.link(p, c);
    }
}

/// Ups in declaration order; downs in reverse, so a composite apply undoes
/// cleanly back to front.
fn split_statements(
    name: &str,
    block: &[StatementDecl],
) -> Result<(Vec<String>, Vec<String>)> {
    let mut up = Vec::new();
    let mut down = Vec::new();
    for stmt in block {
        match stmt {
            StatementDecl::Sql(sql) => {
                let derived = derive_down(sql).map_err(|source| Error::AutoDown {
                    mutation: name.to_string(),
                    source,
                })?;
                push_trimmed(&mut up, sql);
                push_trimmed(&mut down, &derived);
            }
            StatementDecl::UpDown { up: u, down: d } => {
                push_trimmed(&mut up, u);
                push_trimmed(&mut down, d);
            }
        }
    }
    down.reverse();
    Ok((up, down))
}

fn push_trimmed(list: &mut Vec<String>, stmt: &str) {
    let stmt = stmt.trim();
    if !stmt.is_empty() {
        list.push(stmt.to_string());
    }
}

/// Proper dotted prefixes, nearest first: `a.b.c` → `a.b`, `a`.
fn dotted_prefixes(name: &str) -> impl Iterator<Item = &str> {
    name.char_indices()
        .rev()
        .filter(|(_, c)| *c == '.')
        .map(move |(i, _)| &name[..i])
}

fn check_cycles(map: &MutationMap) -> Result<()> {
    let mut done = IndexSet::new();
    let mut visiting = IndexSet::new();
    let mut stack = Vec::new();
    for mutation in map.iter() {
        dfs(map, &mutation.hash, &mut visiting, &mut done, &mut stack)?;
    }
    Ok(())
}

fn dfs(
    map: &MutationMap,
    hash: &Digest,
    visiting: &mut IndexSet<Digest>,
    done: &mut IndexSet<Digest>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if done.contains(hash) {
        return Ok(());
    }
    let mutation = map.get(hash).expect("edges point at owned records");
    if !visiting.insert(hash.clone()) {
        let mut path: Vec<String> = stack
            .iter()
            .skip_while(|n| *n != &mutation.name)
            .cloned()
            .collect();
        path.push(mutation.name.clone());
        return Err(Error::DependencyCycle { path });
    }
    stack.push(mutation.name.clone());
    for parent in &mutation.parents {
        dfs(map, parent, visiting, done, stack)?;
    }
    stack.pop();
    visiting.swap_remove(hash);
    done.insert(hash.clone());
    Ok(())
}
