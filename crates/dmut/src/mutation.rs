//! The mutation record and the hash-indexed graph.
//!
//! A mutation is immutable once loaded: its identity is a digest over its
//! name and statements, and edges are stored as hash sets on both sides, so
//! the graph has no owning cycles. The map is the single owner of every
//! record; all traversals dereference through it.

use dmut_sql::{Digest, DigestBuffer, LexError};
use indexmap::{IndexMap, IndexSet};

use crate::{Error, Result};

/// A named, content-addressed unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub hash: Digest,
    /// Author-visible label. Informational: identity is the hash.
    pub name: String,
    /// Origin path, when known. Diagnostic only, never persisted.
    pub file: Option<String>,
    /// Meta mutations carry role-dependent statements (grants, ownership)
    /// and are redone whenever the role set changes.
    pub meta: bool,
    pub up: Vec<String>,
    pub down: Vec<String>,
    /// Hashes of mutations that depend on this one.
    pub children: IndexSet<Digest>,
    /// Hashes of mutations this one depends on.
    pub parents: IndexSet<Digest>,
}

impl Mutation {
    /// Build a record and compute its hash from name, up and down.
    pub fn new(
        name: impl Into<String>,
        meta: bool,
        up: Vec<String>,
        down: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        let hash = compute_hash(&name, &up, &down)?;
        Ok(Self {
            hash,
            name,
            file: None,
            meta,
            up,
            down,
            children: IndexSet::new(),
            parents: IndexSet::new(),
        })
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// A mutation with no statements never takes part in graph edges and is
    /// never persisted.
    pub fn has_statements(&self) -> bool {
        !self.up.is_empty() || !self.down.is_empty()
    }

    /// `sql` or `meta`, for log lines.
    pub fn layer(&self) -> &'static str {
        if self.meta { "meta" } else { "sql" }
    }
}

/// Digest of `name ∥ up ∥ down` over normalized token streams. This layout
/// is shared with every recorded database, so it must not drift.
pub fn compute_hash(name: &str, up: &[String], down: &[String]) -> std::result::Result<Digest, LexError> {
    let mut buf = DigestBuffer::new();
    buf.add_statement(name)?;
    buf.add_statements(up.iter().map(String::as_str))?;
    buf.add_statements(down.iter().map(String::as_str))?;
    Ok(buf.finish())
}

/// Hash-keyed, insertion-ordered collection of mutations.
///
/// Insertion order is what makes the topological walks deterministic:
/// siblings come out in the order they went in.
#[derive(Debug, Default, Clone)]
pub struct MutationMap {
    inner: IndexMap<Digest, Mutation>,
}

impl MutationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mutation: Mutation) -> Result<()> {
        if self.inner.contains_key(&mutation.hash) {
            return Err(Error::DuplicateHash {
                name: mutation.name,
                hash: mutation.hash,
            });
        }
        self.inner.insert(mutation.hash.clone(), mutation);
        Ok(())
    }

    pub fn remove(&mut self, hash: &Digest) -> Option<Mutation> {
        // shift_remove keeps the insertion order of the survivors.
        self.inner.shift_remove(hash)
    }

    pub fn get(&self, hash: &Digest) -> Option<&Mutation> {
        self.inner.get(hash)
    }

    pub fn contains(&self, hash: &Digest) -> bool {
        self.inner.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.inner.values()
    }

    /// Record that `child` depends on `parent`, symmetrically on both
    /// records. A no-op when either side is missing or has no statements.
    pub fn link(&mut self, parent: &Digest, child: &Digest) {
        let linkable = |m: Option<&Mutation>| m.is_some_and(Mutation::has_statements);
        if !linkable(self.get(parent)) || !linkable(self.get(child)) || parent == child {
            return;
        }
        self.inner
            .get_mut(child)
            .expect("checked above")
            .parents
            .insert(parent.clone());
        self.inner
            .get_mut(parent)
            .expect("checked above")
            .children
            .insert(child.clone());
    }

    /// Deterministic topological walk over the transitive closure of
    /// `seeds` (everything, when `seeds` is empty): parents before children
    /// when `parents_first`, children before parents otherwise.
    ///
    /// Returns owned records so callers can mutate the map while working
    /// through the result.
    pub fn mutations_in_order(&self, parents_first: bool, seeds: &[Digest]) -> Vec<Mutation> {
        let mut seen = IndexSet::new();
        let mut out = Vec::new();
        if seeds.is_empty() {
            for hash in self.inner.keys() {
                self.visit(hash, parents_first, &mut seen, &mut out);
            }
        } else {
            for hash in seeds {
                self.visit(hash, parents_first, &mut seen, &mut out);
            }
        }
        out
    }

    fn visit(
        &self,
        hash: &Digest,
        parents_first: bool,
        seen: &mut IndexSet<Digest>,
        out: &mut Vec<Mutation>,
    ) {
        let Some(mutation) = self.get(hash) else {
            return;
        };
        if !seen.insert(mutation.hash.clone()) {
            return;
        }
        let edges = if parents_first {
            &mutation.parents
        } else {
            &mutation.children
        };
        for next in edges {
            self.visit(next, parents_first, seen, out);
        }
        out.push(mutation.clone());
    }

    /// Mutations nothing depends on.
    pub fn leaf_mutations(&self) -> Vec<&Mutation> {
        self.inner
            .values()
            .filter(|m| m.children.is_empty())
            .collect()
    }

    /// Hashes present here but not in `other`.
    pub fn unique_hashes(&self, other: &MutationMap) -> IndexSet<Digest> {
        self.inner
            .keys()
            .filter(|h| !other.contains(h))
            .cloned()
            .collect()
    }
}
