use approx::assert_relative_eq;
use assert_matches::assert_matches;

use crate::tree::tree_parser::from_newick;
use crate::tree::NodeIdx::{Internal as I, Leaf as L};
use crate::{tree, Checkpoint};

#[test]
fn parse_four_taxon_tree() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    assert_eq!(tree.len(), 7);
    assert_eq!(tree.n, 4);
    assert_eq!(tree.branch_count(), 6);
    assert_eq!(tree.root, I(0));
    assert!(tree.complete);
}

#[test]
fn node_indices_in_preorder_encounter_order() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let nodes = [
        ("G", I(0)),
        ("E", I(1)),
        ("A", L(2)),
        ("B", L(3)),
        ("F", I(4)),
        ("C", L(5)),
        ("D", L(6)),
    ];
    for (id, idx) in nodes.iter() {
        assert_eq!(tree.try_idx(id).unwrap(), *idx);
        assert_eq!(tree.by_id(id).idx, *idx);
    }
    assert!(tree.try_idx("H").is_err());
    assert_matches!(tree.try_idx("A").unwrap(), L(_));
    assert_matches!(tree.try_idx("E").unwrap(), I(_));
}

#[test]
fn heights_from_branch_lengths() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    assert_relative_eq!(tree.height(&tree.root), 2.0);
    assert_relative_eq!(tree.height(&tree.try_idx("E").unwrap()), 1.0);
    assert_relative_eq!(tree.height(&tree.try_idx("A").unwrap()), 0.0);
    for id in ["A", "B", "C", "D", "E", "F"] {
        assert_relative_eq!(tree.blen(&tree.try_idx(id).unwrap()), 1.0);
    }
    assert_relative_eq!(tree.blen(&tree.root), 0.0);
    assert_relative_eq!(tree.total_time(), 6.0);
}

#[test]
fn heights_non_ultrametric() {
    let tree = tree!("((A:1.0,B:2.0)C:1.0,D:0.5)R;");
    assert_relative_eq!(tree.height(&tree.root), 3.0);
    assert_relative_eq!(tree.height(&tree.try_idx("C").unwrap()), 2.0);
    assert_relative_eq!(tree.height(&tree.try_idx("A").unwrap()), 1.0);
    assert_relative_eq!(tree.height(&tree.try_idx("B").unwrap()), 0.0);
    assert_relative_eq!(tree.height(&tree.try_idx("D").unwrap()), 2.5);
    assert_relative_eq!(tree.blen(&tree.try_idx("D").unwrap()), 0.5);
}

#[test]
fn traversal_orders() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    assert_eq!(tree.postorder.len(), 7);
    assert_eq!(tree.preorder.len(), 7);
    assert_eq!(*tree.preorder.first().unwrap(), tree.root);
    assert_eq!(*tree.postorder.last().unwrap(), tree.root);
    // Children precede parents in postorder.
    for (pos, idx) in tree.postorder.iter().enumerate() {
        if let Some(parent) = tree.parent(idx) {
            let parent_pos = tree.postorder.iter().position(|x| *x == parent).unwrap();
            assert!(pos < parent_pos);
        }
    }
}

#[test]
fn branch_nodes_skip_root() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let branches: Vec<_> = tree.branch_nodes().collect();
    assert_eq!(branches.len(), 6);
    assert!(!branches.contains(&tree.root));
}

#[test]
fn non_binary_tree_rejected() {
    assert!(from_newick("(A:1.0,B:1.0,C:1.0)R;").is_err());
}

#[test]
fn malformed_newick_rejected() {
    assert!(from_newick("((A:1.0,B:1.0;").is_err());
}

#[test]
fn set_height_moves_node_and_generation() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let gen = tree.generation();
    let e = tree.try_idx("E").unwrap();
    tree.set_height(&e, 1.5);
    assert_relative_eq!(tree.height(&e), 1.5);
    assert_relative_eq!(tree.blen(&e), 0.5);
    assert_relative_eq!(tree.blen(&tree.try_idx("A").unwrap()), 1.5);
    assert!(tree.generation() > gen);
}

#[test]
#[should_panic]
fn set_height_above_parent_panics() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let e = tree.try_idx("E").unwrap();
    tree.set_height(&e, 2.5);
}

#[test]
#[should_panic]
fn set_height_below_child_panics() {
    let mut tree = tree!("((A:1.0,B:2.0)C:1.0,D:0.5)R;");
    let c = tree.try_idx("C").unwrap();
    tree.set_height(&c, 0.5);
}

#[test]
fn exchange_rewires_subtrees() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let a = tree.try_idx("A").unwrap();
    let c = tree.try_idx("C").unwrap();
    let e = tree.try_idx("E").unwrap();
    let f = tree.try_idx("F").unwrap();
    let gen = tree.generation();
    tree.exchange(&a, &c).unwrap();
    assert_eq!(tree.parent(&a), Some(f));
    assert_eq!(tree.parent(&c), Some(e));
    assert!(tree.children(&e).contains(&c));
    assert!(tree.children(&f).contains(&a));
    assert!(tree.generation() > gen);
    // Indices survive the move.
    assert_eq!(tree.try_idx("A").unwrap(), a);
    assert_eq!(tree.root, I(0));
}

#[test]
fn exchange_invalid_moves_rejected() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let a = tree.try_idx("A").unwrap();
    let b = tree.try_idx("B").unwrap();
    let e = tree.try_idx("E").unwrap();
    let root = tree.root;
    assert!(tree.exchange(&a, &root).is_err());
    assert!(tree.exchange(&a, &b).is_err());
    assert!(tree.exchange(&a, &e).is_err());
}

#[test]
fn store_restore_round_trip() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let e = tree.try_idx("E").unwrap();
    tree.store();
    tree.set_height(&e, 1.5);
    let a = tree.try_idx("A").unwrap();
    let c = tree.try_idx("C").unwrap();
    tree.exchange(&a, &c).unwrap();
    tree.restore();
    assert_relative_eq!(tree.height(&e), 1.0);
    assert_eq!(tree.parent(&a), Some(e));
}

#[test]
fn restore_without_change_keeps_generation() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    tree.store();
    let gen = tree.generation();
    tree.restore();
    assert_eq!(tree.generation(), gen);
}

#[test]
#[should_panic]
fn restore_without_store_panics() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    tree.restore();
}

#[test]
#[should_panic]
fn accept_drops_snapshot() {
    let mut tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    tree.store();
    tree.accept();
    tree.restore();
}

#[test]
fn newick_round_trip() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0)G;");
    let reparsed = tree!(&tree.to_newick());
    assert_eq!(reparsed.len(), tree.len());
    for id in ["A", "B", "C", "D", "E", "F", "G"] {
        assert_relative_eq!(
            reparsed.height(&reparsed.try_idx(id).unwrap()),
            tree.height(&tree.try_idx(id).unwrap())
        );
    }
}
