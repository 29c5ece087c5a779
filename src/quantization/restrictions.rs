// src/quantization/restrictions.rs
//! Restriction catalogs consulted when choosing precision and granularity.
//!
//! Both catalogs are plain values passed into every transformation call;
//! nothing here is global.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{OpType, Precision};

use super::{code_range, required_bits};

/// `(operator kind, input port) → allowed low precisions`, in preference
/// order. Ports without an entry accept anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecisionRestrictions {
    entries: BTreeMap<(OpType, usize), Vec<Precision>>,
}

impl PrecisionRestrictions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, op: OpType, port: usize, precisions: &[Precision]) -> Self {
        self.insert(op, port, precisions.to_vec());
        self
    }

    pub fn insert(&mut self, op: OpType, port: usize, precisions: Vec<Precision>) {
        self.entries.insert((op, port), precisions);
    }

    pub fn allowed(&self, op: OpType, port: usize) -> Option<&[Precision]> {
        self.entries.get(&(op, port)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpType, usize, &[Precision])> {
        self.entries.iter().map(|(&(op, port), v)| (op, port, v.as_slice()))
    }
}

/// Operator kinds that force per-tensor (scalar) dequantization on any
/// quantization group they touch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GranularityRestrictions {
    per_tensor: BTreeSet<OpType>,
}

impl GranularityRestrictions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: OpType) -> Self {
        self.per_tensor.insert(op);
        self
    }

    pub fn insert(&mut self, op: OpType) {
        self.per_tensor.insert(op);
    }

    pub fn requires_per_tensor(&self, op: OpType) -> bool {
        self.per_tensor.contains(&op)
    }

    pub fn is_empty(&self) -> bool {
        self.per_tensor.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OpType> + '_ {
        self.per_tensor.iter().copied()
    }
}

/// Intersection of several allowed lists, keeping the order of the first
/// list. `None` when no list constrains anything.
pub fn intersect<'a>(lists: impl IntoIterator<Item = &'a [Precision]>) -> Option<Vec<Precision>> {
    let mut acc: Option<Vec<Precision>> = None;
    for list in lists {
        acc = Some(match acc {
            None => list.to_vec(),
            Some(prev) => prev.into_iter().filter(|p| list.contains(p)).collect(),
        });
    }
    acc
}

/// Pick the low precision for `levels` codes from what every consumer allows.
///
/// Unsigned of the required width wins, then signed of that width, then the
/// first allowed entry wide enough. `Err` carries the conflict description.
pub fn select_precision(allowed: Option<&[Precision]>, levels: u32) -> Result<Precision, String> {
    let bits = required_bits(levels);
    let unsigned = Precision::unsigned_of(bits);
    let Some(list) = allowed else {
        return unsigned.ok_or_else(|| format!("no unsigned precision of {bits} bits"));
    };
    if list.is_empty() {
        return Err("consumers allow no common precision".to_string());
    }
    [unsigned, Precision::signed_of(bits)]
        .into_iter()
        .flatten()
        .find(|p| list.contains(p))
        .or_else(|| list.iter().copied().find(|&p| code_range(p, levels).is_some()))
        .ok_or_else(|| {
            let names: Vec<String> = list.iter().map(|p| p.to_string()).collect();
            format!("none of [{}] can hold {levels} levels", names.join(", "))
        })
}
