//! Index-based storage for the capability tree.
//!
//! Records live in a `Vec` and are never removed, so an index stays valid for
//! the lifetime of the registry. Parent and child links are indices.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::record::{Capability, Revocation, RevocationCause};
use crate::id::{CapabilityId, ProcessId};

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) capability: Capability,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct CapabilityArena {
    nodes: Vec<Node>,
    index: HashMap<CapabilityId, usize>,
    by_owner: HashMap<ProcessId, Vec<usize>>,
}

impl CapabilityArena {
    pub(crate) fn insert(&mut self, capability: Capability, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.index.insert(capability.id, idx);
        self.by_owner.entry(capability.owner).or_default().push(idx);
        self.nodes.push(Node {
            capability,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(idx);
        }
        idx
    }

    pub(crate) fn index_of(&self, id: &CapabilityId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub(crate) fn get(&self, id: &CapabilityId) -> Option<&Capability> {
        self.index_of(id).map(|idx| &self.nodes[idx].capability)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn owned_by(&self, owner: ProcessId) -> &[usize] {
        self.by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.nodes.iter().map(|n| &n.capability)
    }

    /// Walk from `idx` up to the root, including `idx` itself.
    pub(crate) fn ancestry(&self, idx: usize) -> impl Iterator<Item = &Capability> {
        std::iter::successors(Some(idx), move |i| self.nodes[*i].parent)
            .map(move |i| &self.nodes[i].capability)
    }

    /// Revoke `idx` with `cause` and every live descendant with `cascade`.
    ///
    /// Each record that transitions bumps its epoch once and is appended to
    /// `revoked`. Records that are already revoked keep their original cause.
    pub(crate) fn revoke_subtree(
        &mut self,
        idx: usize,
        cause: RevocationCause,
        cascade: RevocationCause,
        at: DateTime<Utc>,
        revoked: &mut Vec<CapabilityId>,
    ) {
        self.mark(idx, cause, at, revoked);

        let mut stack: Vec<usize> = self.nodes[idx].children.clone();
        while let Some(child) = stack.pop() {
            self.mark(child, cascade, at, revoked);
            stack.extend(self.nodes[child].children.iter().copied());
        }
    }

    fn mark(&mut self, idx: usize, cause: RevocationCause, at: DateTime<Utc>, revoked: &mut Vec<CapabilityId>) {
        let capability = &mut self.nodes[idx].capability;
        if capability.revocation.is_some() {
            return;
        }
        capability.revocation = Some(Revocation { cause, at });
        capability.epoch = capability.epoch.next();
        revoked.push(capability.id);
    }
}
