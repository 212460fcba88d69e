use shardmesh::cluster::ShardAssignmentTable;
use shardmesh::{ClusterConfig, ClusterError, GenerateOptions, ShardMask};
use std::net::{IpAddr, Ipv4Addr};
use tempfile::tempdir;

#[test]
fn test_four_slave_config_round_trips_through_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("cluster.json");
    let options = GenerateOptions::new(4)
        .ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
        .cluster_port_start(39000)
        .seed("10.0.0.1", 38291)
        .db_path_root(dir.path().to_str().unwrap());
    let config = ClusterConfig::generate(&options).unwrap();

    config.save(&path).unwrap();
    let loaded = ClusterConfig::load(&path).unwrap();
    assert_eq!(loaded, config);

    let masks: Vec<u32> = loaded
        .slaves
        .iter()
        .flat_map(|slave| slave.shard_masks.iter().map(|mask| mask.value()))
        .collect();
    assert_eq!(masks, vec![4, 5, 6, 7]);
    assert!(loaded.uncovered_shards().is_empty());

    // the partition has no overlap: every shard has exactly one owner
    let mut table = ShardAssignmentTable::new(loaded.shard_size()).unwrap();
    for slave in &loaded.slaves {
        table.register(&slave.id, &slave.shard_masks);
    }
    for shard in 0..loaded.shard_size() {
        assert_eq!(table.slaves_for(shard).len(), 1);
    }
}

#[test]
fn test_temp_dump_is_loadable() {
    let config = ClusterConfig::generate(&GenerateOptions::new(2)).unwrap();
    let path = config.write_temp().unwrap();
    let loaded = ClusterConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_hand_written_config_with_gap_loads() {
    let json = r#"{
        "master": {
            "db_path_root": "./db/master",
            "server_port": 38291,
            "json_rpc_port": 38391,
            "seed_host": "127.0.0.1",
            "seed_port": 38291,
            "shard_size": 4,
            "devp2p_port": 29000,
            "devp2p_bootstrap_host": "0.0.0.0",
            "devp2p_bootstrap_port": 29000,
            "devp2p_min_peers": 2,
            "devp2p_max_peers": 10
        },
        "slaves": [
            {"id": "S0", "ip": "127.0.0.1", "port": 38000, "shard_masks": [2], "db_path_root": "./db/S0"}
        ]
    }"#;
    let config = ClusterConfig::from_json(json).unwrap();
    assert!(!config.master.devp2p);
    assert_eq!(config.slaves[0].shard_masks, vec![ShardMask::new(2).unwrap()]);
    assert_eq!(config.uncovered_shards(), vec![1, 3]);
}

#[test]
fn test_duplicate_slave_ids_rejected() {
    let mut config = ClusterConfig::generate(&GenerateOptions::new(2)).unwrap();
    config.slaves[1].id = "S0".to_string();
    let json = config.to_json().unwrap();
    assert!(matches!(
        ClusterConfig::from_json(&json),
        Err(ClusterError::Config(_))
    ));
}
