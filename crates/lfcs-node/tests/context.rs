//! Node context behaviour across replicas

use lfcs_core::{Causality, Lattice, LwwRegister, Uid, WireCodec};
use lfcs_node::{Library, LibraryConfig, NodeConfigBuilder, NodeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

fn library() -> Library {
    let node = NodeConfigBuilder::new().initial_blocks(128).build().unwrap();
    Library::new(LibraryConfig { node }).unwrap()
}

#[test]
fn test_uids_are_unique_across_nodes() {
    let lib = library();
    let mut nodes: Vec<_> = (0..4).map(|id| lib.create_node(id).unwrap()).collect();
    let mut rng = StdRng::seed_from_u64(5);
    let mut seen = HashSet::new();

    for _ in 0..200 {
        let node = &mut nodes[rng.gen_range(0..4)];
        assert!(seen.insert(node.gen_uid().unwrap()));
    }
    let total: u64 = nodes.iter().map(|n| n.op_count()).sum();
    assert_eq!(total, 200);
}

#[test]
fn test_merge_then_increment_orders_events() {
    let lib = library();
    let mut a = lib.create_node(0).unwrap();
    let mut b = lib.create_node(1).unwrap();

    a.gen_uid().unwrap();
    b.gen_uid().unwrap();
    assert_eq!(a.clock().compare(b.clock()), Causality::Concurrent);

    let sent = a.clock().clone();
    b.merge_clock(&sent).unwrap();
    assert_eq!(sent.compare(b.clock()), Causality::HappensBefore);
    assert_eq!(b.timestamp(), 2);

    // The clock travels over the wire unchanged.
    let decoded = lfcs_core::VectorClock::from_bytes(&b.clock().to_bytes()).unwrap();
    assert_eq!(&decoded, b.clock());
}

#[test]
fn test_node_ids_are_leased() {
    let lib = library();
    let first = lib.create_node(7).unwrap();
    assert_eq!(lib.create_node(7).unwrap_err(), NodeError::NodeInUse(7));
    assert_eq!(lib.live_nodes(), vec![7]);

    drop(first);
    assert!(lib.live_nodes().is_empty());
    assert!(lib.create_node(7).is_ok());
}

#[test]
fn test_libraries_are_independent() {
    let one = library();
    let two = library();
    let _a = one.create_node(3).unwrap();
    let _b = two.create_node(3).unwrap();
    assert!(matches!(
        one.create_node(99),
        Err(NodeError::InvalidNodeId { node_id: 99, .. })
    ));
    assert_eq!(one.live_nodes(), vec![3]);
}

#[test]
fn test_orset_replicas_through_contexts() {
    let lib = library();
    let mut a = lib.create_node(0).unwrap();
    let mut b = lib.create_node(1).unwrap();
    let mut set_a = a.new_orset().unwrap();
    let mut set_b = b.new_orset().unwrap();

    a.orset_add(&mut set_a, b"item").unwrap();
    let tag = b.orset_add(&mut set_b, b"item").unwrap();
    assert_eq!(tag, Uid::new(1, 1));
    set_b.remove(b"item").unwrap();

    set_a.merge(&set_b).unwrap();
    set_b.merge(&set_a.try_clone().unwrap()).unwrap();
    assert!(set_a.contains(b"item"));
    assert_eq!(set_a, set_b);
}

#[test]
fn test_registers_written_by_contexts_converge() {
    let lib = library();
    let mut a = lib.create_node(0).unwrap();
    let mut b = lib.create_node(1).unwrap();
    let mut reg_a = LwwRegister::new();
    let mut reg_b = LwwRegister::new();

    a.write_register(&mut reg_a, b"from-a").unwrap();
    b.write_register(&mut reg_b, b"from-b").unwrap();

    reg_a.merge(&reg_b).unwrap();
    reg_b.merge(&reg_a.clone()).unwrap();
    assert_eq!(reg_a, reg_b);
    // Equal timestamps: the higher node id wins.
    assert_eq!(reg_a.get(), Some(&b"from-b"[..]));
}

#[test]
fn test_concurrent_readers_via_registered_threads() {
    let lib = library();
    let mut node = lib.create_node(0).unwrap();
    let mut set = node.new_orset().unwrap();
    for i in 0..64u32 {
        node.orset_add(&mut set, &i.to_le_bytes()).unwrap();
    }

    let reader = set.reader();
    std::thread::scope(|s| {
        for _ in 0..4 {
            let reader = reader.clone();
            s.spawn(move || {
                let guard = reader.memory().domain.register().unwrap();
                for i in 0..64u32 {
                    assert!(reader.contains(&guard, &i.to_le_bytes()).unwrap());
                }
            });
        }
    });
    assert!(node.register_thread().is_ok());
}
