#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{Harness, Op, capture_warnings, network};
use rsched::{
    error::{ConfigError, Error, SequencingError},
    node::NodeGroup,
    types::NodeId,
};

/// Position of every node of `order`, for dependency checks.
fn position(order: &[NodeId], node: NodeId) -> usize {
    order.iter().position(|&n| n == node).unwrap()
}

fn is_subsequence(sub: &[NodeId], full: &[NodeId]) -> bool {
    let mut rest = full.iter();
    sub.iter().all(|node| rest.any(|n| n == node))
}

#[test]
fn chain_orders_follow_dependencies() {
    // A -> B -> C
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Scale(2.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(3.0), &[b]);
    net.compile().unwrap();

    assert_eq!(net.roots(), &[c]);
    assert_eq!(net.eval_order(None).unwrap().as_slice(), &[a, b, c]);
    assert_eq!(net.eval_order(Some(c)).unwrap().as_slice(), &[a, b, c]);

    assert_eq!(net.build_order(Some(b)).unwrap().as_slice(), &[a, b]);
    assert_eq!(net.eval_order(Some(b)).unwrap().as_slice(), &[a, b]);
}

#[test]
fn reading_an_unbuilt_order_names_the_root() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Scale(2.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(3.0), &[b]);

    assert_eq!(
        net.eval_order(Some(c)).unwrap_err(),
        Error::Sequencing(SequencingError::OrderNotBuilt { root: "C".into() })
    );
    assert_eq!(
        net.build_order(Some(c)).unwrap_err(),
        Error::Sequencing(SequencingError::GlobalOrderNotBuilt)
    );

    net.build_order(None).unwrap();
    net.compile().unwrap();
    assert_eq!(
        net.eval_order(Some(b)).unwrap_err(),
        Error::Sequencing(SequencingError::OrderNotBuilt { root: "B".into() })
    );
}

#[test]
fn global_order_can_be_built_before_compiling() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Scale(2.0), &[a]);

    let (order, warnings) = capture_warnings(|| net.build_order(None).unwrap().to_vec());
    assert_eq!(order, vec![a, b]);
    assert!(warnings.is_empty(), "{warnings}");

    // Rebuilding is allowed, yields the same order and says so.
    let (order, warnings) = capture_warnings(|| net.build_order(None).unwrap().to_vec());
    assert_eq!(order, vec![a, b]);
    assert!(warnings.contains("global evaluation order built twice"), "{warnings}");

    net.build_order(Some(a)).unwrap();
    let (order, warnings) = capture_warnings(|| net.build_order(Some(a)).unwrap().to_vec());
    assert_eq!(order, vec![a]);
    assert!(warnings.contains("evaluation order built twice"), "{warnings}");
    assert!(warnings.contains("root=A"), "{warnings}");
    assert!(!net.is_compiled());
}

#[test]
fn root_orders_are_subsequences_of_the_global_order() {
    //      I
    //    /   \
    //   A     B
    //    \   / \
    //      S    R2
    //      |
    //      R1
    let h = Harness::new();
    let mut net = network();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Scale(2.0), &[i]);
    let b = h.add(&mut net, "B", Op::Scale(3.0), &[i]);
    let s = h.add(&mut net, "S", Op::Plus, &[a, b]);
    let r1 = h.add(&mut net, "R1", Op::Scale(0.5), &[s]);
    let r2 = h.add(&mut net, "R2", Op::Plus, &[b, i]);
    net.compile().unwrap();

    assert_eq!(net.roots(), &[r1, r2]);
    let global = net.eval_order(None).unwrap().to_vec();
    assert_eq!(global.len(), 6);

    for root in [r1, r2] {
        let order = net.eval_order(Some(root)).unwrap();
        assert!(is_subsequence(order, &global));
        assert_eq!(order.last(), Some(&root));
        for &node in order.iter() {
            for &input in net.node(node).unwrap().inputs() {
                assert!(position(order, input) < position(order, node));
            }
        }
    }
    assert_eq!(net.eval_order(Some(r2)).unwrap().len(), 3);
    assert!(!net.eval_order(Some(r2)).unwrap().contains(&a));
}

#[test]
fn sort_by_global_order_filters_and_dedups() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Scale(2.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(3.0), &[b]);
    net.compile().unwrap();

    assert_eq!(net.sort_by_global_order([c, a, c, b]).unwrap(), vec![a, b, c]);
    assert_eq!(net.sort_by_global_order([c, a]).unwrap(), vec![a, c]);
}

#[test]
fn tagged_outputs_and_explicit_roots_are_roots_too() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Scale(2.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(3.0), &[b]);
    net.tag(b, NodeGroup::Output).unwrap();
    net.compile().unwrap();
    assert_eq!(net.roots(), &[b, c]);
    assert_eq!(net.eval_order(Some(b)).unwrap().as_slice(), &[a, b]);

    net.add_root(a).unwrap();
    assert!(!net.is_compiled());
    net.compile().unwrap();
    assert_eq!(net.roots(), &[a, b, c]);
    assert_eq!(net.plan(a).unwrap().root(), a);
}

#[test]
fn a_network_where_every_node_is_consumed_has_no_roots() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Plus, &[]);
    let d = h.add(&mut net, "D", Op::Delay(1), &[a]);
    net.set_inputs(a, &[d]).unwrap();

    assert_eq!(net.compile().unwrap_err(), Error::Config(ConfigError::NoRoots));

    net.add_root(a).unwrap();
    net.compile().unwrap();
    assert_eq!(net.loops().len(), 1);
}

#[test]
fn only_recurrent_nodes_may_read_themselves() {
    let h = Harness::new();
    let mut net = network();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Plus, &[i]);
    net.set_inputs(a, &[i, a]).unwrap();
    assert_eq!(
        net.compile().unwrap_err(),
        Error::Config(ConfigError::SelfInput { name: "A".into() })
    );

    let mut net = network();
    let d = h.add(&mut net, "D", Op::Delay(1), &[]);
    net.set_inputs(d, &[d]).unwrap();
    net.compile().unwrap();
    // Reading itself doesn't count as being consumed.
    assert_eq!(net.roots(), &[d]);
    assert_eq!(net.loops().len(), 1);
    assert_eq!(net.loops()[0].name(), "Loop_D");
}

#[test]
fn edges_to_deleted_nodes_are_rejected() {
    let h = Harness::new();
    let mut net = network();
    let gone = h.add(&mut net, "X", Op::Input, &[]);
    net.delete_node(gone).unwrap();

    let err = net.add_node(h.spec("Y", Op::Scale(1.0), &[gone])).unwrap_err();
    assert_eq!(
        err,
        Error::Config(ConfigError::DanglingInput {
            name: "Y".into(),
            input: gone,
        })
    );
    assert_eq!(
        net.add_root(gone).unwrap_err(),
        Error::Config(ConfigError::MissingRoot { id: gone })
    );
    // Handles are never reused.
    let fresh = h.add(&mut net, "X", Op::Input, &[]);
    assert_ne!(fresh, gone);
}

#[test]
fn names_are_unique() {
    let h = Harness::new();
    let mut net = network();
    let a = h.add(&mut net, "A", Op::Input, &[]);
    let b = h.add(&mut net, "B", Op::Input, &[]);

    assert_eq!(
        net.add_node(h.spec("A", Op::Input, &[])).unwrap_err(),
        Error::Config(ConfigError::DuplicateName { name: "A".into() })
    );
    assert_eq!(
        net.rename_node(b, "A").unwrap_err(),
        Error::Config(ConfigError::DuplicateName { name: "A".into() })
    );
    net.rename_node(a, "A").unwrap();
    assert_eq!(net.node_by_name("A").unwrap(), a);
}

#[test]
fn name_patterns_and_operation_queries() {
    let h = Harness::new();
    let mut net = network();
    let i = h.add(&mut net, "input", Op::Input, &[]);
    let w1 = h.add(&mut net, "layer1.w", Op::Param, &[]);
    let b1 = h.add(&mut net, "layer1.b", Op::Param, &[]);
    let s1 = h.add(&mut net, "layer1.out", Op::Plus, &[i, w1, b1]);
    let w2 = h.add(&mut net, "layer2.w", Op::Param, &[]);
    let s2 = h.add(&mut net, "layer2.out", Op::Plus, &[s1, w2]);
    let o = h.add(&mut net, "output", Op::Scale(1.0), &[s2]);
    net.compile().unwrap();

    assert_eq!(net.nodes_matching("layer1.*"), vec![w1, b1, s1]);
    assert_eq!(net.nodes_matching("*.w"), vec![w1, w2]);
    assert_eq!(net.nodes_matching("layer1.b"), vec![b1]);
    assert!(net.nodes_matching("layer3.*").is_empty());

    assert_eq!(net.nodes_with_operation("Plus", None).unwrap(), vec![s1, s2]);
    assert_eq!(net.nodes_with_operation("Param", Some(o)).unwrap(), vec![w1, b1, w2]);
    assert_eq!(net.learnable_parameters(o).unwrap(), vec![w1, b1, w2]);
    assert_eq!(net.input_nodes(o).unwrap(), vec![i]);
    assert_eq!(net.consumers_of(s1), vec![s2]);
    assert_eq!(
        net.node_by_name("missing").unwrap_err(),
        Error::Config(ConfigError::UnknownName {
            name: "missing".into()
        })
    );
}
