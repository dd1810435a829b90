#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{
    Harness, Op, TestConfig, feed, gradient, network, network_without_sharing, values,
};
use rsched::{
    error::{ConfigError, Error, SequencingError},
    network::Network,
    node::NodeGroup,
    parallel,
    pool::Buffer,
    types::{FrameRange, MinibatchLayout, NodeId},
};

/// L = 3 (I + W), a criterion.
struct Linear {
    net: Network<TestConfig>,
    h: Harness,
    i: NodeId,
    w: NodeId,
    p: NodeId,
    l: NodeId,
}

fn linear() -> Linear {
    let h = Harness::new();
    let mut net = network();
    let i = net
        .add_node(h.spec("I", Op::Input, &[]).tag(NodeGroup::Feature))
        .unwrap();
    let w = h.add(&mut net, "W", Op::Param, &[]);
    let p = h.add(&mut net, "P", Op::Plus, &[i, w]);
    let l = net
        .add_node(h.spec("L", Op::Scale(3.0), &[p]).tag(NodeGroup::Criterion))
        .unwrap();
    net.compile().unwrap();
    Linear { net, h, i, w, p, l }
}

fn load(net: &mut Network<TestConfig>, i: NodeId, w: NodeId) {
    feed(net, i, &[1.0, 2.0]);
    feed(net, w, &[0.5]);
    net.notify_inputs_modified(MinibatchLayout::new(2, 1)).unwrap();
}

#[test]
fn evaluation_needs_a_compiled_network() {
    let h = Harness::new();
    let mut net = network();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Scale(2.0), &[i]);

    assert_eq!(
        net.forward_propagate(a).unwrap_err(),
        Error::Sequencing(SequencingError::NotCompiled {
            operation: "forward_propagate"
        })
    );
    assert_eq!(
        net.backpropagate(a).unwrap_err(),
        Error::Sequencing(SequencingError::NotCompiled {
            operation: "backpropagate"
        })
    );
    assert!(matches!(
        net.plan(a),
        Err(Error::Sequencing(SequencingError::NotCompiled { .. }))
    ));
}

#[test]
fn compile_is_idempotent() {
    let Linear { mut net, l, .. } = linear();
    let version = net.structure_version();
    let steps = net.flow_steps(l).unwrap().to_vec();
    net.compile().unwrap();
    assert_eq!(net.structure_version(), version);
    assert_eq!(net.flow_steps(l).unwrap(), steps.as_slice());
}

#[test]
fn forward_then_backward_through_a_criterion() {
    let Linear {
        mut net, h, i, w, p, l,
    } = linear();
    load(&mut net, i, w);
    net.forward_propagate(l).unwrap();
    assert_eq!(values(&net, p), Some(vec![1.5, 2.5]));
    assert_eq!(values(&net, l), Some(vec![4.5, 7.5]));

    net.backpropagate(l).unwrap();
    // dL/dW summed over both frames.
    assert_eq!(gradient(&net, w), Some(vec![6.0]));
    assert_eq!(gradient(&net, p), None);
    assert_eq!(gradient(&net, i), None);
    // Backward recycles what it no longer needs; roots and leaves stay.
    assert_eq!(values(&net, p), None);
    assert_eq!(values(&net, l), Some(vec![4.5, 7.5]));
    assert_eq!(values(&net, w), Some(vec![0.5]));
    assert_eq!(h.backwards_of("P"), vec![(1, FrameRange::All)]);
}

#[test]
fn gradients_restart_from_zero_every_pass() {
    let Linear {
        mut net, i, w, l, ..
    } = linear();
    load(&mut net, i, w);
    for _ in 0..3 {
        net.forward_propagate(l).unwrap();
        net.backpropagate(l).unwrap();
        assert_eq!(gradient(&net, w), Some(vec![6.0]));
    }
}

#[test]
fn backward_needs_forward_values() {
    let Linear {
        mut net, i, w, p, l, ..
    } = linear();
    load(&mut net, i, w);
    assert_eq!(
        net.backpropagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::ValueNotComputed { name: "L".into() })
    );

    net.forward_propagate(l).unwrap();
    net.backpropagate(l).unwrap();
    // P was recycled by the first backward pass and L is still current.
    assert!(values(&net, p).is_none());
    assert_eq!(
        net.backpropagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::ValueNotComputed { name: "P".into() })
    );
}

#[test]
fn inputs_must_be_announced() {
    let Linear {
        mut net, i, w, l, ..
    } = linear();
    feed(&mut net, i, &[1.0, 2.0]);
    assert_eq!(
        net.forward_propagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::InputsNotNotified)
    );

    feed(&mut net, w, &[0.5]);
    net.notify_inputs_modified(MinibatchLayout::new(2, 1)).unwrap();
    net.forward_propagate(l).unwrap();

    // Writing in place counts as a modification too.
    net.input_value_mut(i).unwrap().fill(1.0);
    assert_eq!(
        net.forward_propagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::InputsNotNotified)
    );
    net.notify_inputs_modified(MinibatchLayout::new(2, 1)).unwrap();
    net.forward_propagate(l).unwrap();
    assert_eq!(values(&net, l), Some(vec![4.5, 4.5]));
}

#[test]
fn only_leaves_accept_injected_data() {
    let Linear { mut net, p, .. } = linear();
    assert_eq!(
        net.input_value_mut(p).unwrap_err(),
        Error::Sequencing(SequencingError::NotAnInputNode { name: "P".into() })
    );
}

#[test]
fn injected_shapes_must_match_the_layout() {
    let Linear {
        mut net, i, w, l, ..
    } = linear();
    feed(&mut net, i, &[1.0, 2.0, 3.0]);
    feed(&mut net, w, &[0.5]);
    let err = net.notify_inputs_modified(MinibatchLayout::new(2, 1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::InputShapeMismatch { ref name, .. }) if name == "I"
    ));
    // Still unannounced.
    assert_eq!(
        net.forward_propagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::InputsNotNotified)
    );

    net.notify_inputs_modified(MinibatchLayout::new(3, 1)).unwrap();
    net.forward_propagate(l).unwrap();
    assert_eq!(values(&net, l), Some(vec![4.5, 7.5, 10.5]));
}

#[test]
fn layout_changes_recompute_everything_shaped_by_it() {
    let Linear {
        mut net, h, i, w, l, ..
    } = linear();
    load(&mut net, i, w);
    net.forward_propagate(l).unwrap();

    h.clear();
    feed(&mut net, i, &[1.0, 2.0, 3.0, 4.0]);
    net.notify_inputs_modified(MinibatchLayout::new(2, 2)).unwrap();
    net.forward_propagate(l).unwrap();
    assert_eq!(h.forward_labels(), ["P", "L"]);
    assert_eq!(values(&net, l), Some(vec![4.5, 7.5, 10.5, 13.5]));
    // Parameters don't depend on the minibatch.
    assert_eq!(values(&net, w), Some(vec![0.5]));
}

#[test]
fn stale_feature_buffers_block_a_layout_change() {
    let h = Harness::new();
    let mut net = network();
    let a = net
        .add_node(h.spec("A", Op::Input, &[]).tag(NodeGroup::Feature))
        .unwrap();
    let b = net
        .add_node(h.spec("B", Op::Input, &[]).tag(NodeGroup::Label))
        .unwrap();
    h.add(&mut net, "S", Op::Plus, &[a, b]);
    net.compile().unwrap();
    feed(&mut net, a, &[1.0]);
    feed(&mut net, b, &[1.0]);
    net.notify_inputs_modified(MinibatchLayout::new(1, 1)).unwrap();

    feed(&mut net, a, &[1.0, 2.0]);
    let err = net.notify_inputs_modified(MinibatchLayout::new(1, 2)).unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::InputShapeMismatch { ref name, .. }) if name == "B"
    ));
    assert_eq!(net.layout(), MinibatchLayout::new(1, 1));
}

#[test]
fn timestamps_drive_recomputation() {
    let Linear {
        mut net, h, i, w, p, l,
    } = linear();
    load(&mut net, i, w);
    net.forward_propagate(l).unwrap();
    h.clear();

    // Up to date: nothing runs.
    net.forward_propagate(l).unwrap();
    assert!(h.events().is_empty());

    net.bump_eval_timestamps(&[w]).unwrap();
    net.forward_propagate(l).unwrap();
    assert_eq!(h.forward_labels(), ["P", "L"]);
    assert!(net.node(l).unwrap().eval_timestamp() > net.node(p).unwrap().eval_timestamp());

    h.clear();
    net.reset_eval_timestamps();
    // Leaves have no stamp either, so they are "computed" by their no-op kernels.
    net.forward_propagate(l).unwrap();
    assert_eq!(h.forward_labels(), ["I", "W", "P", "L"]);
    assert_eq!(values(&net, l), Some(vec![4.5, 7.5]));
}

#[test]
fn partial_forward_starts_after_the_frontier() {
    // I -> A -> B -> C
    let h = Harness::new();
    let mut net = network_without_sharing();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Scale(2.0), &[i]);
    let b = h.add(&mut net, "B", Op::Scale(3.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(5.0), &[b]);
    net.compile().unwrap();
    feed(&mut net, i, &[1.0]);
    net.notify_inputs_modified(MinibatchLayout::new(1, 1)).unwrap();
    net.forward_propagate(c).unwrap();

    assert_eq!(net.partial_forward_order(&[a], &[c]).unwrap(), vec![b, c]);
    assert_eq!(net.partial_forward_order(&[b], &[c]).unwrap(), vec![c]);
    assert_eq!(net.partial_forward_order(&[i], &[b]).unwrap(), vec![a, b]);

    h.clear();
    net.bump_eval_timestamps(&[b]).unwrap();
    net.forward_propagate_from_to(&[b], &[c]).unwrap();
    assert_eq!(h.forward_labels(), ["C"]);
    assert_eq!(values(&net, c), Some(vec![30.0]));
}

#[test]
fn partial_forward_leaves_side_branches_alone() {
    // I -> A, J -> S, T = A + S
    let h = Harness::new();
    let mut net = network_without_sharing();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Scale(2.0), &[i]);
    let j = h.add(&mut net, "J", Op::Input, &[]);
    let s = h.add(&mut net, "S", Op::Scale(3.0), &[j]);
    let t = h.add(&mut net, "T", Op::Plus, &[a, s]);
    net.compile().unwrap();
    feed(&mut net, i, &[1.0]);
    feed(&mut net, j, &[1.0]);
    net.notify_inputs_modified(MinibatchLayout::new(1, 1)).unwrap();
    net.forward_propagate(t).unwrap();

    assert_eq!(net.partial_forward_order(&[a], &[t]).unwrap(), vec![t]);
    assert_eq!(net.partial_forward_order(&[j], &[t]).unwrap(), vec![s, t]);
    // Targets that don't read from the frontier have nothing to run.
    assert!(net.partial_forward_order(&[a], &[s]).unwrap().is_empty());

    h.clear();
    net.bump_eval_timestamps(&[a]).unwrap();
    net.forward_propagate_from_to(&[a], &[t]).unwrap();
    assert_eq!(h.forward_labels(), ["T"]);
    assert_eq!(values(&net, t), Some(vec![5.0]));
}

#[test]
fn partial_forward_needs_the_frontier_value() {
    let h = Harness::new();
    let mut net = network();
    let i = h.add(&mut net, "I", Op::Input, &[]);
    let a = h.add(&mut net, "A", Op::Scale(2.0), &[i]);
    let b = h.add(&mut net, "B", Op::Scale(3.0), &[a]);
    let c = h.add(&mut net, "C", Op::Scale(5.0), &[b]);
    net.compile().unwrap();
    feed(&mut net, i, &[1.0]);
    net.notify_inputs_modified(MinibatchLayout::new(1, 1)).unwrap();
    net.forward_propagate(c).unwrap();

    // B was recycled once C had read it.
    net.reset_eval_timestamps();
    assert_eq!(
        net.forward_propagate_from_to(&[b], &[c]).unwrap_err(),
        Error::Sequencing(SequencingError::ValueNotComputed { name: "B".into() })
    );
}

#[test]
fn partial_forward_treats_a_loop_as_a_whole() {
    let h = Harness::new();
    let mut net = network();
    let x = h.add(&mut net, "X", Op::Input, &[]);
    let d = h.add(&mut net, "D", Op::Delay(1), &[]);
    let e = h.add(&mut net, "E", Op::Plus, &[x, d]);
    net.set_inputs(d, &[e]).unwrap();
    let o = h.add(&mut net, "O", Op::Scale(2.0), &[e]);
    net.compile().unwrap();

    assert_eq!(net.partial_forward_order(&[d], &[o]).unwrap(), vec![o]);
    assert_eq!(net.partial_forward_order(&[x], &[o]).unwrap(), vec![d, e, o]);
}

#[test]
fn group_queries_follow_the_root_order() {
    let Linear { net, i, w, p, l, .. } = linear();
    assert_eq!(net.group(NodeGroup::Criterion), vec![l]);
    assert_eq!(net.nodes_in_group(NodeGroup::Feature, l).unwrap(), vec![i]);
    assert!(net.nodes_in_group(NodeGroup::Label, l).unwrap().is_empty());
    assert_eq!(net.input_nodes(l).unwrap(), vec![i]);
    assert_eq!(net.learnable_parameters(l).unwrap(), vec![w]);
    assert_eq!(
        net.nodes_in_group(NodeGroup::Feature, p).unwrap_err(),
        Error::Sequencing(SequencingError::OrderNotBuilt { root: "P".into() })
    );
}

#[test]
fn edits_invalidate_the_compiled_state() {
    let Linear {
        mut net, h, i, w, p, l,
    } = linear();
    load(&mut net, i, w);
    net.forward_propagate(l).unwrap();
    let version = net.structure_version();

    net.rename_node(p, "sum").unwrap();
    assert!(!net.is_compiled());
    assert!(net.structure_version() > version);
    assert_eq!(net.node_by_name("sum").unwrap(), p);
    assert!(net.node_by_name("P").is_err());
    assert_eq!(
        net.forward_propagate(l).unwrap_err(),
        Error::Sequencing(SequencingError::NotCompiled {
            operation: "forward_propagate"
        })
    );

    // Replacing rewires consumers to the new handle.
    let q = net
        .replace_node(p, h.spec("Q", Op::Plus, &[i, w, w]))
        .unwrap();
    assert!(net.node(p).is_none());
    assert_eq!(net.node(l).unwrap().inputs(), &[q]);
    assert_eq!(
        net.delete_node(i).unwrap_err(),
        Error::Config(ConfigError::NodeInUse {
            name: "I".into(),
            consumers: vec!["Q".into()],
        })
    );

    net.compile().unwrap();
    net.forward_propagate(l).unwrap();
    // 3 (I + 2 W)
    assert_eq!(values(&net, l), Some(vec![6.0, 9.0]));

    net.delete_node(l).unwrap();
    assert_eq!(
        net.tag(l, NodeGroup::Output).unwrap_err(),
        Error::Config(ConfigError::UnknownNode { id: l })
    );
    net.compile().unwrap();
    assert_eq!(net.roots(), &[q]);
}

#[test]
fn forks_evaluate_in_parallel() {
    let Linear {
        mut net, i, w, l, ..
    } = linear();
    load(&mut net, i, w);

    let mut forks = parallel::fork_many(&net, 4);
    for (k, fork) in forks.iter_mut().enumerate() {
        let base = f64::from(u32::try_from(k).unwrap());
        feed(fork, i, &[base, base]);
        fork.notify_inputs_modified(MinibatchLayout::new(2, 1)).unwrap();
    }
    parallel::forward_each(&mut forks, l).unwrap();

    let results = parallel::map_each(&mut forks, |fork| values(fork, l));
    for (k, result) in results.into_iter().enumerate() {
        let expected = 3.0 * (f64::from(u32::try_from(k).unwrap()) + 0.5);
        assert_eq!(result, Some(vec![expected, expected]));
    }
    // Forks share the clock but nothing else.
    assert_eq!(net.clock().now(), forks[0].clock().now());
    assert_eq!(values(&net, l), None);
    assert_eq!(net.pool_stats().allocated, 0);
}
