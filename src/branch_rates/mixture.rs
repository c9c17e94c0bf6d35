use std::cell::RefCell;

use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::{debug, info};

use crate::branch_rates::arbitrary::node_param_map;
use crate::branch_rates::cache::Memo;
use crate::branch_rates::{assert_not_root, BranchRateModel, CATEGORY_TRAIT, RATE_TRAIT};
use crate::parameter::ParamHandle;
use crate::tree::{NodeIdx, Tree};
use crate::{Checkpoint, Result};

/// Assigns every branch one of `category_count()` integer labels.
pub trait BranchCategoryProvider {
    fn category(&self, tree: &Tree, node: &NodeIdx) -> usize;
    fn category_count(&self) -> usize;
    /// Monotone counter over whatever drives the assignment.
    fn dependency_generation(&self, tree: &Tree) -> u64;
    fn store(&mut self) {}
    fn restore(&mut self) {}
    fn accept(&mut self) {}
}

/// Every branch in the single category zero.
pub struct SingleCategory;

impl BranchCategoryProvider for SingleCategory {
    fn category(&self, _tree: &Tree, _node: &NodeIdx) -> usize {
        0
    }

    fn category_count(&self) -> usize {
        1
    }

    fn dependency_generation(&self, _tree: &Tree) -> u64 {
        0
    }
}

/// Per-branch independent assignment persisted in an integer-valued
/// parameter.
pub struct ParameterCategories {
    allocation: ParamHandle,
    count: usize,
    node_to_param: Vec<Option<usize>>,
}

impl ParameterCategories {
    pub fn new(tree: &Tree, allocation: ParamHandle, count: usize) -> Result<Self> {
        if allocation.borrow().dim() != tree.branch_count() {
            bail!(
                "Need one category per branch: parameter {} has dimension {}, tree has {} branches.",
                allocation.borrow().id,
                allocation.borrow().dim(),
                tree.branch_count()
            );
        }
        if count == 0 {
            bail!("Category count must be positive.");
        }
        Ok(Self {
            allocation,
            count,
            node_to_param: node_param_map(tree),
        })
    }
}

impl BranchCategoryProvider for ParameterCategories {
    fn category(&self, _tree: &Tree, node: &NodeIdx) -> usize {
        let i = self.node_to_param[usize::from(node)]
            .expect("non-root node missing from the parameter map");
        let raw = self.allocation.borrow().value(i);
        let category = raw.round();
        assert!(
            category >= 0.0 && (category as usize) < self.count,
            "Category {} for {} outside [0, {}).",
            raw,
            node,
            self.count
        );
        category as usize
    }

    fn category_count(&self) -> usize {
        self.count
    }

    fn dependency_generation(&self, _tree: &Tree) -> u64 {
        self.allocation.borrow().generation()
    }
}

/// Clade-membership assignment: branches inside a listed clade take its
/// category, everything else stays in category zero. Nested clades win
/// because assignment follows the preorder.
pub struct CladeCategories {
    clades: Vec<(Vec<String>, usize)>,
    count: usize,
    map: RefCell<Memo<Vec<usize>>>,
}

impl CladeCategories {
    pub fn new(tree: &Tree, clades: Vec<(Vec<String>, usize)>, count: usize) -> Result<Self> {
        for (taxa, category) in &clades {
            if taxa.is_empty() {
                bail!("A clade category needs at least one taxon.");
            }
            if *category >= count {
                bail!("Clade category {} outside [0, {}).", category, count);
            }
            for taxon in taxa {
                tree.try_idx(taxon)?;
            }
        }
        Ok(Self {
            clades,
            count,
            map: RefCell::new(Memo::new(Vec::new())),
        })
    }

    fn rebuild(&self, tree: &Tree, map: &mut Vec<usize>) {
        debug!("Rebuilding the clade category map.");
        let leaf_bit: HashMap<usize, usize> = tree
            .leaf_indices()
            .enumerate()
            .map(|(bit, idx)| (usize::from(&idx), bit))
            .collect();
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
        let mut mrca_of: HashMap<usize, usize> = HashMap::new();
        for (c, (taxa, _)) in self.clades.iter().enumerate() {
            let mut bits = FixedBitSet::with_capacity(tree.n);
            for taxon in taxa {
                let idx = tree.try_idx(taxon).expect("clade taxon vanished from the tree");
                bits.insert(leaf_bit[&usize::from(&idx)]);
            }
            let mut cur = tree.try_idx(&taxa[0]).unwrap();
            while !bits.is_subset(&tipsets[usize::from(&cur)]) {
                cur = tree.parent(&cur).expect("clade taxa not all below the root");
            }
            mrca_of.insert(usize::from(&cur), c);
        }
        *map = vec![0; tree.len()];
        for idx in &tree.preorder {
            let i = usize::from(idx);
            let inherited = match tree.parent(idx) {
                Some(parent) => map[usize::from(&parent)],
                None => 0,
            };
            map[i] = match mrca_of.get(&i) {
                Some(&c) => self.clades[c].1,
                None => inherited,
            };
        }
    }
}

impl BranchCategoryProvider for CladeCategories {
    fn category(&self, tree: &Tree, node: &NodeIdx) -> usize {
        let mut map = self.map.borrow_mut();
        map.read(vec![tree.generation()], |map| self.rebuild(tree, map))[usize::from(node)]
    }

    fn category_count(&self) -> usize {
        self.count
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        tree.generation()
    }

    fn store(&mut self) {
        self.map.get_mut().store();
    }

    fn restore(&mut self) {
        self.map.get_mut().restore();
    }

    fn accept(&mut self) {
        self.map.get_mut().accept();
    }
}

/// Categorical fixed-effects clock: each branch's rate is the fixed effect
/// of its category, optionally combined with a per-category time covariate
/// (coefficient times log midpoint height) and any number of random-effect
/// sub-models. Effects add; with `log_space` the sum is exponentiated, so
/// the combination is multiplicative on the rate scale.
pub struct CountableMixture {
    rates: ParamHandle,
    provider: Box<dyn BranchCategoryProvider>,
    log_space: bool,
    time_coefficients: Option<ParamHandle>,
    random_effects: Vec<Box<dyn BranchRateModel>>,
}

impl CountableMixture {
    pub fn new(
        rates: ParamHandle,
        provider: Box<dyn BranchCategoryProvider>,
        log_space: bool,
        time_coefficients: Option<ParamHandle>,
        random_effects: Vec<Box<dyn BranchRateModel>>,
    ) -> Result<Self> {
        if rates.borrow().dim() != provider.category_count() {
            bail!(
                "Need one fixed effect per category: parameter {} has dimension {}, provider has {} categories.",
                rates.borrow().id,
                rates.borrow().dim(),
                provider.category_count()
            );
        }
        if let Some(coefficients) = &time_coefficients {
            if coefficients.borrow().dim() != provider.category_count() {
                bail!(
                    "Need one time coefficient per category, got dimension {}.",
                    coefficients.borrow().dim()
                );
            }
        }
        info!(
            "Countable mixture clock with {} categories and {} random effect(s).",
            provider.category_count(),
            random_effects.len()
        );
        Ok(Self {
            rates,
            provider,
            log_space,
            time_coefficients,
            random_effects,
        })
    }

    pub fn category(&self, tree: &Tree, node: &NodeIdx) -> usize {
        self.provider.category(tree, node)
    }
}

impl BranchRateModel for CountableMixture {
    fn branch_rate(&self, tree: &Tree, node: &NodeIdx) -> f64 {
        assert_not_root(tree, node);
        let category = self.provider.category(tree, node);
        let mut total = self.rates.borrow().value(category);
        if let Some(coefficients) = &self.time_coefficients {
            let parent = tree.parent(node).unwrap();
            let midpoint = 0.5 * (tree.height(&parent) + tree.height(node));
            assert!(
                midpoint > 0.0,
                "Time covariate needs a positive midpoint height for {}.",
                node
            );
            total += coefficients.borrow().value(category) * midpoint.ln();
        }
        for effect in &self.random_effects {
            total += effect.branch_rate(tree, node);
        }
        if self.log_space {
            total.exp()
        } else {
            total
        }
    }

    fn dependency_generation(&self, tree: &Tree) -> u64 {
        let mut generation =
            self.provider.dependency_generation(tree) + self.rates.borrow().generation();
        if let Some(coefficients) = &self.time_coefficients {
            generation += tree.generation() + coefficients.borrow().generation();
        }
        for effect in &self.random_effects {
            generation += effect.dependency_generation(tree);
        }
        generation
    }

    fn tree_trait_names(&self) -> Vec<&'static str> {
        vec![RATE_TRAIT, CATEGORY_TRAIT]
    }

    fn tree_trait(&self, name: &str, tree: &Tree, node: &NodeIdx) -> Option<f64> {
        match name {
            RATE_TRAIT => Some(self.branch_rate(tree, node)),
            CATEGORY_TRAIT => Some(self.provider.category(tree, node) as f64),
            _ => None,
        }
    }
}

impl Checkpoint for CountableMixture {
    fn store(&mut self) {
        self.provider.store();
        for effect in &mut self.random_effects {
            effect.store();
        }
    }

    fn restore(&mut self) {
        self.provider.restore();
        for effect in &mut self.random_effects {
            effect.restore();
        }
    }

    fn accept(&mut self) {
        self.provider.accept();
        for effect in &mut self.random_effects {
            effect.accept();
        }
    }
}
