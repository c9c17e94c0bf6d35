use std::cell::RefCell;

use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::{debug, info};

use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// A clock zone covering every branch inside the clade spanned by `taxa`.
pub struct CladeClock {
    pub taxa: Vec<String>,
    pub rate: ParamHandle,
    /// Whether the branch above the clade root switches too.
    pub include_stem: bool,
    /// Portion of the stem branch on the clade side of the switch point;
    /// the stem rate blends clade and surrounding rates accordingly.
    pub stem_proportion: f64,
    /// Assign only the stem, leaving the clade interior on the surrounding
    /// rate.
    pub exclude_clade: bool,
}

/// A clock zone covering the leaf branches of the named taxa.
pub struct ExternalClock {
    pub taxa: Vec<String>,
    pub rate: ParamHandle,
}

/// A clock zone covering all branches ancestral to one distinguished tip,
/// named either directly or through an integer-valued index parameter over
/// the tips (so the trunk tip itself can be sampled).
pub struct TrunkClock {
    pub taxon: Option<String>,
    pub index: Option<ParamHandle>,
    pub rate: ParamHandle,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Zone {
    Background,
    External(usize),
    Clade(usize),
    /// Stem branch of clade `i`; blended with the inherited zone.
    Stem(usize),
    Trunk(usize),
}

#[derive(Clone, Default)]
struct ZoneMap {
    /// Zone of the branch above each node.
    zone: Vec<Zone>,
    /// Zone the node's children inherit (never a stem).
    below: Vec<Zone>,
    /// Zone inherited from above, used for stem blending.
    inherited: Vec<Zone>,
}

/// Local molecular clock: disjoint clock zones over the branches, defined
/// by clade membership, explicit external-branch assignment, or a trunk
/// path. The zone-to-node map is rebuilt lazily on any topology or
/// trunk-index change; nested clades win because assignment follows the
/// preorder down the tree.
pub struct LocalClock {
    background: ParamHandle,
    clades: Vec<CladeClock>,
    externals: Vec<ExternalClock>,
    trunks: Vec<TrunkClock>,
    zones: RefCell<Memo<ZoneMap>>,
}

impl LocalClock {
    pub fn new(
        tree: &Tree,
        background: ParamHandle,
        clades: Vec<CladeClock>,
        externals: Vec<ExternalClock>,
        trunks: Vec<TrunkClock>,
    ) -> Result<Self> {
        if background.borrow().dim() != 1 {
            bail!("The background clock rate must have dimension 1.");
        }
        for clade in &clades {
            if clade.rate.borrow().dim() != 1 {
                bail!("Each clade clock rate must have dimension 1.");
            }
            if clade.taxa.is_empty() {
                bail!("A clade clock needs at least one taxon.");
            }
            if !(0.0..=1.0).contains(&clade.stem_proportion) {
                bail!(
                    "Stem proportion {} outside [0, 1].",
                    clade.stem_proportion
                );
            }
            for taxon in &clade.taxa {
                tree.try_idx(taxon)?;
            }
        }
        for external in &externals {
            if external.rate.borrow().dim() != 1 {
                bail!("Each external clock rate must have dimension 1.");
            }
            for taxon in &external.taxa {
                if !tree.is_leaf(&tree.try_idx(taxon)?) {
                    bail!("External clock taxon {} is not a tip.", taxon);
                }
            }
        }
        for trunk in &trunks {
            if trunk.rate.borrow().dim() != 1 {
                bail!("Each trunk clock rate must have dimension 1.");
            }
            match (&trunk.taxon, &trunk.index) {
                (Some(taxon), None) => {
                    if !tree.is_leaf(&tree.try_idx(taxon)?) {
                        bail!("Trunk taxon {} is not a tip.", taxon);
                    }
                }
                (None, Some(index)) => {
                    if index.borrow().dim() != 1 {
                        bail!("The trunk index parameter must have dimension 1.");
                    }
                }
                _ => bail!("A trunk clock needs exactly one of a taxon or an index parameter."),
            }
        }
        info!(
            "Local clock with {} clade, {} external and {} trunk zone(s).",
            clades.len(),
            externals.len(),
            trunks.len()
        );
        Ok(Self {
            background,
            clades,
            externals,
            trunks,
            zones: RefCell::new(Memo::new(ZoneMap::default())),
        })
    }

    fn stamp(&self, tree: &Tree) -> Vec<u64> {
        let mut stamp = vec![tree.generation()];
        for trunk in &self.trunks {
            if let Some(index) = &trunk.index {
                stamp.push(index.borrow().generation());
            }
        }
        stamp
    }

    fn rebuild(&self, tree: &Tree, map: &mut ZoneMap) {
        debug!("Rebuilding the local clock zone map.");
        let leaf_bit: HashMap<usize, usize> = tree
            .leaf_indices()
            .enumerate()
            .map(|(bit, idx)| (usize::from(&idx), bit))
            .collect();

        // Tip sets below every node, postorder.
        let mut tipsets = vec![FixedBitSet::with_capacity(tree.n); tree.len()];
        for idx in &tree.postorder {
            let i = usize::from(idx);
            if tree.is_leaf(idx) {
                tipsets[i].insert(leaf_bit[&i]);
            } else {
                for child in tree.children(idx) {
                    let child_set = tipsets[usize::from(child)].clone();
                    tipsets[i].union_with(&child_set);
                }
            }
        }

        // One MRCA per clade; a later clade on the same node wins.
        let mut mrca_of: HashMap<usize, usize> = HashMap::new();
        for (c, clade) in self.clades.iter().enumerate() {
            let mut bits = FixedBitSet::with_capacity(tree.n);
            for taxon in &clade.taxa {
                let idx = tree.try_idx(taxon).expect("clade taxon vanished from the tree");
                bits.insert(leaf_bit[&usize::from(&idx)]);
            }
            let mut cur = tree.try_idx(&clade.taxa[0]).unwrap();
            while !bits.is_subset(&tipsets[usize::from(&cur)]) {
                cur = tree
                    .parent(&cur)
                    .expect("clade taxa not all below the root");
            }
            mrca_of.insert(usize::from(&cur), c);
        }

        map.zone = vec![Zone::Background; tree.len()];
        map.below = vec![Zone::Background; tree.len()];
        map.inherited = vec![Zone::Background; tree.len()];
        for idx in &tree.preorder {
            let i = usize::from(idx);
            let inherited = match tree.parent(idx) {
                Some(parent) => map.below[usize::from(&parent)],
                None => Zone::Background,
            };
            map.inherited[i] = inherited;
            let (zone, below) = match mrca_of.get(&i) {
                Some(&c) => {
                    let clade = &self.clades[c];
                    let below = if clade.exclude_clade {
                        inherited
                    } else {
                        Zone::Clade(c)
                    };
                    let zone = if clade.include_stem {
                        Zone::Stem(c)
                    } else {
                        inherited
                    };
                    (zone, below)
                }
                None => (inherited, inherited),
            };
            map.zone[i] = zone;
            map.below[i] = below;
        }

        for (e, external) in self.externals.iter().enumerate() {
            for taxon in &external.taxa {
                let idx = tree
                    .try_idx(taxon)
                    .expect("external clock taxon vanished from the tree");
                map.zone[usize::from(&idx)] = Zone::External(e);
            }
        }

        for (t, trunk) in self.trunks.iter().enumerate() {
            let tip = self.trunk_tip(tree, trunk);
            let mut cur = tip;
            loop {
                map.zone[usize::from(&cur)] = Zone::Trunk(t);
                match tree.parent(&cur) {
                    Some(parent) if !tree.is_root(&parent) => cur = parent,
                    _ => break,
                }
            }
        }
    }

    fn trunk_tip(&self, tree: &Tree, trunk: &TrunkClock) -> NodeIdx {
        match (&trunk.taxon, &trunk.index) {
            (Some(taxon), None) => tree
                .try_idx(taxon)
                .expect("trunk taxon vanished from the tree"),
            (None, Some(index)) => {
                let i = index.borrow().value(0).round();
                assert!(
                    i >= 0.0 && (i as usize) < tree.n,
                    "Trunk tip index {} outside [0, {}).",
                    i,
                    tree.n
                );
                tree.leaf_indices()
                    .nth(i as usize)
                    .expect("tip index out of range")
            }
            _ => unreachable!("validated at construction"),
        }
    }

    fn zone_rate(&self, zone: Zone) -> f64 {
        match zone {
            Zone::Background => self.background.borrow().value(0),
            Zone::External(e) => self.externals[e].rate.borrow().value(0),
            Zone::Clade(c) => self.clades[c].rate.borrow().value(0),
            Zone::Trunk(t) => self.trunks[t].rate.borrow().value(0),
            Zone::Stem(_) => unreachable!("stems are blended, not looked up"),
        }
    }
}

impl BranchRateModel for LocalClock {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        let i = usize::from(node);
        let mut zones = self.zones.borrow_mut();
        let map = zones.read(self.stamp(tree), |map| self.rebuild(tree, map));
        match map.zone[i] {
            Zone::Stem(c) => {
                let clade = &self.clades[c];
                let p = clade.stem_proportion;
                let surrounding = self.zone_rate(map.inherited[i]);
                p * clade.rate.borrow().value(0) + (1.0 - p) * surrounding
            }
            zone => self.zone_rate(zone),
        }
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        let mut generation = tree.generation() + self.background.borrow().generation();
        for clade in &self.clades {
            generation += clade.rate.borrow().generation();
        }
        for external in &self.externals {
            generation += external.rate.borrow().generation();
        }
        for trunk in &self.trunks {
            generation += trunk.rate.borrow().generation();
            if let Some(index) = &trunk.index {
                generation += index.borrow().generation();
            }
        }
        generation
    }
}

impl Checkpoint for LocalClock {
    fn store(&mut self) {
        self.zones.get_mut().store();
    }

    fn restore(&mut self) {
        self.zones.get_mut().restore();
    }

    fn accept(&mut self) {
        self.zones.get_mut().accept();
    }
}
