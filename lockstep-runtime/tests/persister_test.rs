use lockstep_api::Persister;
use lockstep_common::types::{EdgeState, Message, Mutation, PartitionSnapshot, VertexState};
use lockstep_runtime::persist::FsPersister;
use std::collections::HashMap;

#[test]
fn test_partition_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let persister = FsPersister::new(dir.path());

    let mut vertex = VertexState::new("a", bincode::serialize(&42u64).unwrap());
    vertex.add_out_edge(EdgeState::new("b", Vec::new()));
    vertex.vote_to_halt();
    let snapshot = PartitionSnapshot {
        vertices: vec![vertex, VertexState::new("b", bincode::serialize(&7u64).unwrap())],
        pending: vec![Message::new("b", b"ping".to_vec())],
        mutations: vec![
            Mutation::RemoveVertex {
                id: "c".to_string(),
            },
            Mutation::AddEdge {
                source: "a".to_string(),
                edge: EdgeState::new("c", Vec::new()),
            },
        ],
    };

    persister.persist_partition(3, 1, &snapshot).unwrap();
    let loaded = persister.load_partition(3, 1).unwrap();
    assert_eq!(loaded, snapshot);

    // Untouched superstep or partition slots stay absent.
    assert!(persister.load_partition(3, 2).is_err());
    assert!(persister.load_partition(4, 1).is_err());
}

#[test]
fn test_partition_map_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let persister = FsPersister::new(dir.path());

    let mut map = HashMap::new();
    map.insert(0u32, "127.0.0.1:4000".to_string());
    map.insert(1u32, "127.0.0.1:4001".to_string());
    map.insert(2u32, "127.0.0.1:4000".to_string());

    persister.persist_master(5, &map).unwrap();
    assert_eq!(persister.load_master(5).unwrap(), map);
    assert!(persister.load_master(6).is_err());
}
