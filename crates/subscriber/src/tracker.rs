//! Head tracker: arena of observed heads plus the canonical path through them.
//!
//! Heads live in a flat arena indexed by identity; each node caches the arena index of its
//! parent when the parent was already known at insertion. The canonical chain is a
//! height -> node index map covering `[tip - history_depth, tip]`. Anything older is pruned,
//! and ancestry that escapes the retained window is reported as [AncestryError] rather than
//! guessed at.

use crate::head::{BlockHash, Head, HeadError};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Why a head's ancestry could not be connected to the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AncestryError {
    #[error("parent {parent} of #{height} is not in the retained history")]
    MissingParent { height: u64, parent: BlockHash },

    #[error("ancestry of #{height} leaves the retained history window ({depth} blocks)")]
    BeyondHistory { height: u64, depth: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvanceError {
    #[error(transparent)]
    Head(#[from] HeadError),
    #[error(transparent)]
    Ancestry(#[from] AncestryError),
}

/// How the canonical chain moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainChange {
    /// First head after an empty or reseeded tracker.
    Seeded { tip: Head },
    /// New tip descends from the previous one.
    Extended { from: Head, to: Head },
    /// New tip forked off below the previous one; `orphaned` lists the displaced canonical
    /// heads in ascending height.
    Reorg {
        common_ancestor: Head,
        orphaned: Vec<Head>,
        tip: Head,
    },
}

impl ChainChange {
    pub fn tip(&self) -> &Head {
        match self {
            ChainChange::Seeded { tip } => tip,
            ChainChange::Extended { to, .. } => to,
            ChainChange::Reorg { tip, .. } => tip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Changed(ChainChange),
    /// Same block as the current tip.
    Duplicate,
    /// A block already on the canonical chain below the tip; the tip does not move back.
    Stale,
    /// A competing block below the highest confirmed-at height. Kept in the arena; the chain
    /// switches only once a descendant at or above that height arrives.
    Deferred,
}

/// Position of a block relative to the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicality {
    Canonical,
    Orphaned,
    /// Above the tip, or in a height range whose ancestry is not known.
    Unknown,
}

#[derive(Debug, Clone)]
struct Node {
    head: Head,
    parent: Option<usize>,
}

#[derive(Debug)]
pub struct HeadTracker {
    nodes: Vec<Node>,
    index: HashMap<BlockHash, usize>,
    canonical: BTreeMap<u64, usize>,
    tip: Option<usize>,
    history_depth: u64,
    /// Highest tip a confirmation was emitted at.
    confirmed_height: Option<u64>,
}

impl HeadTracker {
    pub fn new(history_depth: u64) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            canonical: BTreeMap::new(),
            tip: None,
            history_depth,
            confirmed_height: None,
        }
    }

    pub fn history_depth(&self) -> u64 {
        self.history_depth
    }

    pub fn tip(&self) -> Option<Head> {
        self.tip.map(|i| self.nodes[i].head)
    }

    /// Number of heads held in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.contains_key(hash)
    }

    /// Records that a confirmation was emitted with the tip at `height`. The canonical tip never
    /// moves below the highest such height.
    pub fn mark_confirmed(&mut self, height: u64) {
        self.confirmed_height = Some(self.confirmed_height.map_or(height, |c| c.max(height)));
    }

    pub fn confirmed_height(&self) -> Option<u64> {
        self.confirmed_height
    }

    /// True if adopting a tip at `height` would fall below a confirmed-at height.
    pub fn is_below_confirmed(&self, height: u64) -> bool {
        self.confirmed_height.is_some_and(|c| height < c)
    }

    /// Lowest height kept by pruning.
    pub fn window_floor(&self) -> u64 {
        self.tip()
            .map(|t| t.height.saturating_sub(self.history_depth))
            .unwrap_or(0)
    }

    /// Canonical head at `height`, if that height is inside the known canonical segment.
    pub fn canonical_at(&self, height: u64) -> Option<Head> {
        self.canonical.get(&height).map(|&i| self.nodes[i].head)
    }

    /// Records `head` in the arena without touching the canonical chain.
    pub fn insert(&mut self, head: Head) -> Result<usize, HeadError> {
        head.validate()?;
        if let Some(&idx) = self.index.get(&head.hash) {
            let known = &self.nodes[idx].head;
            if known.height != head.height || known.parent_hash != head.parent_hash {
                return Err(HeadError::Conflicting {
                    hash: head.hash,
                    known_height: known.height,
                    height: head.height,
                });
            }
            return Ok(idx);
        }
        let parent = self.lookup_parent(&head);
        let idx = self.nodes.len();
        self.nodes.push(Node { head, parent });
        self.index.insert(head.hash, idx);
        Ok(idx)
    }

    fn lookup_parent(&self, head: &Head) -> Option<usize> {
        self.index
            .get(&head.parent_hash)
            .copied()
            .filter(|&p| head.extends(&self.nodes[p].head))
    }

    fn parent_of(&self, idx: usize) -> Option<usize> {
        let node = &self.nodes[idx];
        node.parent.or_else(|| self.lookup_parent(&node.head))
    }

    fn is_canonical_idx(&self, idx: usize) -> bool {
        self.canonical.get(&self.nodes[idx].head.height) == Some(&idx)
    }

    /// Makes `head` the canonical tip if its ancestry reaches the current canonical chain.
    ///
    /// On error the canonical chain is unchanged; a structurally valid head is still kept in the
    /// arena so that a later head can connect through it.
    pub fn advance(&mut self, head: Head) -> Result<Advance, AdvanceError> {
        let Some(tip_idx) = self.tip else {
            let idx = self.insert(head)?;
            self.seed(idx);
            return Ok(Advance::Changed(ChainChange::Seeded { tip: head }));
        };
        let previous = self.nodes[tip_idx].head;
        if head.height < self.window_floor() {
            return Err(AncestryError::BeyondHistory {
                height: head.height,
                depth: self.history_depth,
            }
            .into());
        }
        let idx = self.insert(head)?;
        if idx == tip_idx {
            return Ok(Advance::Duplicate);
        }
        if self.is_canonical_idx(idx) {
            return Ok(Advance::Stale);
        }
        if self.is_below_confirmed(head.height) {
            return Ok(Advance::Deferred);
        }

        let lowest = self.canonical.keys().next().copied().unwrap_or(previous.height);
        let mut path = vec![idx];
        let mut cursor = idx;
        let ancestor = loop {
            let Some(parent) = self.parent_of(cursor) else {
                let node = self.nodes[cursor].head;
                return Err(AncestryError::MissingParent {
                    height: node.height,
                    parent: node.parent_hash,
                }
                .into());
            };
            if self.is_canonical_idx(parent) {
                break parent;
            }
            if self.nodes[parent].head.height <= lowest {
                return Err(AncestryError::BeyondHistory {
                    height: head.height,
                    depth: self.history_depth,
                }
                .into());
            }
            path.push(parent);
            cursor = parent;
        };

        let common_ancestor = self.nodes[ancestor].head;
        let displaced = self.canonical.split_off(&(common_ancestor.height + 1));
        let orphaned: Vec<Head> = displaced.values().map(|&i| self.nodes[i].head).collect();
        for &i in &path {
            self.canonical.insert(self.nodes[i].head.height, i);
        }
        self.tip = Some(idx);
        self.prune();

        let change = if orphaned.is_empty() {
            ChainChange::Extended {
                from: previous,
                to: head,
            }
        } else {
            ChainChange::Reorg {
                common_ancestor,
                orphaned,
                tip: head,
            }
        };
        Ok(Advance::Changed(change))
    }

    /// Discards the canonical chain and rebuilds it from `head`'s known ancestry.
    pub fn reseed(&mut self, head: Head) -> Result<ChainChange, HeadError> {
        let idx = self.insert(head)?;
        self.seed(idx);
        Ok(ChainChange::Seeded { tip: head })
    }

    fn seed(&mut self, idx: usize) {
        self.canonical.clear();
        self.tip = Some(idx);
        let floor = self.window_floor();
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            let height = self.nodes[i].head.height;
            if height < floor {
                break;
            }
            self.canonical.insert(height, i);
            cursor = self.parent_of(i);
        }
        self.prune();
    }

    /// Where `head` stands relative to the current canonical chain.
    pub fn canonicality(&self, head: &Head) -> Canonicality {
        if let Some(&i) = self.canonical.get(&head.height) {
            return if self.nodes[i].head.hash == head.hash {
                Canonicality::Canonical
            } else {
                Canonicality::Orphaned
            };
        }
        let Some(tip) = self.tip() else {
            return Canonicality::Unknown;
        };
        if head.height <= tip.height {
            return Canonicality::Unknown;
        }
        // Above the tip: orphaned if its known ancestry crosses the canonical range off-chain.
        let Some(mut idx) = self.index.get(&head.hash).copied() else {
            return Canonicality::Unknown;
        };
        loop {
            let node = &self.nodes[idx].head;
            if node.height <= tip.height {
                return match self.canonical.get(&node.height) {
                    Some(&c) if c != idx => Canonicality::Orphaned,
                    _ => Canonicality::Unknown,
                };
            }
            match self.parent_of(idx) {
                Some(p) => idx = p,
                None => return Canonicality::Unknown,
            }
        }
    }

    fn compaction_threshold(&self) -> usize {
        (self.history_depth as usize).saturating_add(1).saturating_mul(2).max(64)
    }

    fn prune(&mut self) {
        let floor = self.window_floor();
        self.canonical = self.canonical.split_off(&floor);
        if self.nodes.len() <= self.compaction_threshold() {
            return;
        }
        let old = std::mem::take(&mut self.nodes);
        let mut remap = HashMap::with_capacity(old.len());
        for (old_idx, node) in old.into_iter().enumerate() {
            if node.head.height >= floor {
                remap.insert(old_idx, self.nodes.len());
                self.nodes.push(node);
            }
        }
        for node in &mut self.nodes {
            node.parent = node.parent.and_then(|p| remap.get(&p).copied());
        }
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.head.hash, i))
            .collect();
        self.canonical = self
            .canonical
            .iter()
            .filter_map(|(&h, i)| remap.get(i).map(|&n| (h, n)))
            .collect();
        self.tip = self.tip.and_then(|t| remap.get(&t).copied());
        tracing::debug!(retained = self.nodes.len(), floor, "head arena compacted");
    }

    /// Drops every head and the canonical chain.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.canonical.clear();
        self.tip = None;
        self.confirmed_height = None;
    }
}
