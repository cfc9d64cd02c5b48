//! PowersDag: a depth-optimal straight-line program for ciphertext powers
//!
//! A query transmits ciphertexts for a sparse set of *source* powers of the
//! encrypted value. Every power the polynomial evaluation needs (the
//! *target* set) must then be produced by multiplying pairs of known powers
//! — and every multiplication costs a level of multiplicative depth, which
//! is the scarce resource in leveled HE.
//!
//! The DAG assigns each non-source target `n` a parent pair `(a, b)` with
//! `a + b = n`, both parents themselves targets, chosen to minimize
//! `max(depth(a), depth(b)) + 1`; ties break toward the smallest `a`.
//! Because targets are scanned in increasing order, all candidate parents
//! are resolved before their children. The overall [`PowersDag::depth`] is
//! the circuit's multiplicative depth.
//!
//! [`PowersDag::parallel_apply`] drives the actual ciphertext computation:
//! nodes are visited level by level (sources first), so a node's closure
//! only ever runs after both parents' closures completed — the only
//! happens-before relation power computation needs.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::pool::WorkerPool;

/// Errors surfaced while configuring a [`PowersDag`].
#[derive(Debug, thiserror::Error)]
pub enum PowersError {
    #[error("power sets cannot contain 0")]
    ZeroPower,
    #[error("power sets must contain 1")]
    MissingOne,
    #[error("source powers must be a subset of target powers")]
    SourceNotSubset,
    #[error("target power {0} is not a sum of two smaller target powers")]
    Unreachable(u32),
}

/// One node of the DAG: a power, its depth, and (for non-sources) the pair
/// of parent powers it is the product of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowersNode {
    /// The exponent this node produces.
    pub power: u32,
    /// Multiplicative depth: 0 for sources, `1 + max(parent depths)` else.
    pub depth: u32,
    /// `None` for transmitted source powers.
    pub parents: Option<(u32, u32)>,
}

impl PowersNode {
    /// Whether this power arrives on the wire rather than being computed.
    #[inline]
    pub fn is_source(&self) -> bool {
        self.parents.is_none()
    }
}

/// The configured DAG. Immutable once built; one instance serves a query.
#[derive(Clone, Debug)]
pub struct PowersDag {
    nodes: BTreeMap<u32, PowersNode>,
    target_powers: BTreeSet<u32>,
    depth: u32,
    source_count: u32,
}

impl PowersDag {
    /// Build the DAG for `source_powers ⊆ target_powers`.
    ///
    /// Preconditions: neither set contains 0, both contain 1, and sources
    /// are a subset of targets. Fails with [`PowersError::Unreachable`] if
    /// some target cannot be written as a sum of two target powers (the
    /// parameter validation in `PsiParams` rules this out for well-formed
    /// query power sets).
    pub fn configure(
        source_powers: &BTreeSet<u32>,
        target_powers: &BTreeSet<u32>,
    ) -> Result<Self, PowersError> {
        if source_powers.contains(&0) || target_powers.contains(&0) {
            return Err(PowersError::ZeroPower);
        }
        if !source_powers.contains(&1) || !target_powers.contains(&1) {
            return Err(PowersError::MissingOne);
        }
        if !source_powers.is_subset(target_powers) {
            return Err(PowersError::SourceNotSubset);
        }

        let mut nodes: BTreeMap<u32, PowersNode> = BTreeMap::new();
        for &s in source_powers {
            nodes.insert(
                s,
                PowersNode {
                    power: s,
                    depth: 0,
                    parents: None,
                },
            );
        }

        let mut overall_depth = 0u32;
        for &curr in target_powers {
            if source_powers.contains(&curr) {
                continue;
            }

            // Scan candidate parents in increasing order of the first
            // component; the first depth-optimal pair therefore has the
            // smallest `a`.
            let mut best: Option<(u32, u32, u32)> = None;
            for &s1 in target_powers.range(..curr) {
                let s2 = curr - s1;
                if !target_powers.contains(&s2) {
                    continue;
                }
                // Both parents precede `curr` in the scan order, so their
                // nodes exist already.
                let d1 = nodes[&s1].depth;
                let d2 = nodes[&s2].depth;
                let depth = d1.max(d2) + 1;
                if best.map_or(true, |(_, _, d)| depth < d) {
                    best = Some((s1, s2, depth));
                }
            }

            let (s1, s2, depth) = best.ok_or(PowersError::Unreachable(curr))?;
            nodes.insert(
                curr,
                PowersNode {
                    power: curr,
                    depth,
                    parents: Some((s1, s2)),
                },
            );
            overall_depth = overall_depth.max(depth);
        }

        Ok(Self {
            nodes,
            target_powers: target_powers.clone(),
            depth: overall_depth,
            source_count: source_powers.len() as u32,
        })
    }

    /// The circuit's multiplicative depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of transmitted source powers.
    #[inline]
    pub fn source_count(&self) -> u32 {
        self.source_count
    }

    /// The full target power set.
    #[inline]
    pub fn target_powers(&self) -> &BTreeSet<u32> {
        &self.target_powers
    }

    /// Look up a node by power.
    pub fn node(&self, power: u32) -> Option<&PowersNode> {
        self.nodes.get(&power)
    }

    /// All nodes in increasing power order.
    pub fn nodes(&self) -> impl Iterator<Item = &PowersNode> {
        self.nodes.values()
    }

    /// The source nodes (depth 0).
    pub fn source_nodes(&self) -> Vec<&PowersNode> {
        self.nodes.values().filter(|n| n.is_source()).collect()
    }

    /// Nodes grouped by depth, shallowest first; the visiting order
    /// [`parallel_apply`](Self::parallel_apply) uses.
    pub fn levels(&self) -> Vec<Vec<&PowersNode>> {
        let mut levels: Vec<Vec<&PowersNode>> = vec![Vec::new(); self.depth as usize + 1];
        for node in self.nodes.values() {
            levels[node.depth as usize].push(node);
        }
        levels
    }

    /// Apply `f` to every node such that `f(parent)` happens before
    /// `f(child)`, sources first. Nodes within one depth level run in
    /// parallel on `pool`; the level boundary is a barrier.
    pub fn parallel_apply<E, F>(&self, pool: &WorkerPool, f: F) -> Result<(), E>
    where
        F: Fn(&PowersNode) -> Result<(), E> + Sync,
        E: Send,
    {
        for level in self.levels() {
            pool.install(|| level.par_iter().try_for_each(|node| f(node)))?;
        }
        Ok(())
    }

    /// Render the DAG in Graphviz dot format (diagnostics).
    pub fn to_dot(&self) -> String {
        use std::fmt::Write;

        let mut out = String::from("digraph powers {\n");
        for node in self.nodes.values() {
            writeln!(out, "\t{};", node.power).expect("string write");
            if let Some((p1, p2)) = node.parents {
                writeln!(out, "\t{} -> {};", node.power, p1).expect("string write");
                writeln!(out, "\t{} -> {};", node.power, p2).expect("string write");
            }
        }
        out.push_str("}\n");
        out
    }
}

// ============================================================================
// Tests
// ============================================================================
