use std::collections::BTreeSet;
use std::sync::Arc;

use shardgrid::distributed::{
    Backend, CommGroupCache, LocalWorld, ParallelAxis, ProcessTopology, TopologyConfig,
};
use shardgrid::Error;

fn build_all(world_size: usize, config: &TopologyConfig) -> Vec<ProcessTopology> {
    let world = LocalWorld::new(world_size);
    world
        .endpoints()
        .into_iter()
        .map(|ep| {
            let cache = Arc::new(CommGroupCache::new(Arc::new(ep)));
            ProcessTopology::new(cache, config).expect("valid topology")
        })
        .collect()
}

#[test]
fn test_four_rank_scenario() {
    let topos = build_all(4, &TopologyConfig::default().with_tp_degree(2).with_dp_degree(2));

    let rows: Vec<Vec<usize>> = topos.iter().map(|t| t.row_ranks().unwrap().to_vec()).collect();
    let cols: Vec<Vec<usize>> = topos.iter().map(|t| t.col_ranks().unwrap().to_vec()).collect();
    assert_eq!(rows, vec![vec![0, 1], vec![0, 1], vec![2, 3], vec![2, 3]]);
    assert_eq!(cols, vec![vec![0, 2], vec![1, 3], vec![0, 2], vec![1, 3]]);

    let r1 = &topos[1];
    assert_eq!(r1.row_group().unwrap().ranks(), &[0, 1]);
    assert_eq!(r1.col_group().unwrap().ranks(), &[1, 3]);
}

#[test]
fn test_grid_partitions_world() {
    for world_size in 1..=12usize {
        for tp in (1..=world_size).filter(|tp| world_size % tp == 0) {
            let dp = world_size / tp;
            let topos = build_all(world_size, &TopologyConfig::default().with_tp_degree(tp));

            let mut rows = BTreeSet::new();
            let mut cols = BTreeSet::new();
            for (rank, topo) in topos.iter().enumerate() {
                let row = topo.row_ranks().unwrap();
                let col = topo.col_ranks().unwrap();
                assert_eq!(row.len(), tp);
                assert_eq!(col.len(), dp);
                assert_eq!(row.iter().filter(|&&r| r == rank).count(), 1);
                assert_eq!(col.iter().filter(|&&r| r == rank).count(), 1);
                assert_eq!(row[topo.local_row_index().unwrap()], rank);
                assert_eq!(col[topo.local_col_index().unwrap()], rank);
                rows.insert(row.to_vec());
                cols.insert(col.to_vec());
            }

            // dp disjoint rows, tp disjoint columns, each covering the world
            assert_eq!(rows.len(), dp);
            assert_eq!(cols.len(), tp);
            let row_union: BTreeSet<usize> = rows.iter().flatten().copied().collect();
            let col_union: BTreeSet<usize> = cols.iter().flatten().copied().collect();
            let all: BTreeSet<usize> = (0..world_size).collect();
            assert_eq!(row_union, all);
            assert_eq!(col_union, all);
            assert_eq!(rows.iter().map(Vec::len).sum::<usize>(), world_size);
            assert_eq!(cols.iter().map(Vec::len).sum::<usize>(), world_size);
        }
    }
}

#[test]
fn test_every_rank_creates_every_group() {
    let world = LocalWorld::new(6);
    let config = TopologyConfig::default().with_dp_degree(2);
    for ep in world.endpoints() {
        let cache = Arc::new(CommGroupCache::new(Arc::new(ep)));
        let mut topo = ProcessTopology::new(Arc::clone(&cache), &config).unwrap();
        // 2 rows + 3 columns
        assert_eq!(cache.len(), 5);
        topo.extend_cpu_groups().unwrap();
        assert_eq!(cache.len(), 10);
        assert!(cache.len() <= 2 * (2 + 3));
    }
    assert_eq!(world.groups_created(), 10);
}

#[test]
fn test_diverging_configs_are_caught() {
    let world = LocalWorld::new(2);
    let mut eps = world.endpoints().into_iter();

    let cache0 = Arc::new(CommGroupCache::new(Arc::new(eps.next().unwrap())));
    ProcessTopology::new(cache0, &TopologyConfig::default().with_tp_degree(2)).unwrap();

    let cache1 = Arc::new(CommGroupCache::new(Arc::new(eps.next().unwrap())));
    let err = ProcessTopology::new(cache1, &TopologyConfig::default()).unwrap_err();
    assert!(matches!(err, Error::DistributedError { .. }));
}

#[test]
fn test_degree_resolution_scenarios() {
    let topos = build_all(6, &TopologyConfig::default().with_dp_degree(2));
    assert_eq!(topos[0].tp_degree().unwrap(), 3);

    let world = LocalWorld::new(6);
    let cache = Arc::new(CommGroupCache::new(Arc::new(world.endpoint(0).unwrap())));
    let err =
        ProcessTopology::new(cache, &TopologyConfig::default().with_dp_degree(4)).unwrap_err();
    assert!(matches!(err, Error::DegreeMismatch { .. }));

    let cache = Arc::new(CommGroupCache::new(Arc::new(world.endpoint(0).unwrap())));
    let err = ProcessTopology::new(
        cache,
        &TopologyConfig::default().with_tp_degree(2).with_dp_degree(2),
    )
    .unwrap_err();
    assert!(matches!(err, Error::DegreeMismatch { .. }));
    assert_eq!(world.groups_created(), 0);
}

#[test]
fn test_equality_across_caches() {
    let config = TopologyConfig::default().with_tp_degree(2);
    let a = build_all(4, &config);
    let b = build_all(4, &config);
    for rank in 0..4 {
        assert_eq!(a[rank], b[rank]);
    }
    assert_ne!(a[0], a[1]);
    assert_ne!(a[0], b[3]);
}

#[test]
fn test_subset_grid_from_config_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "rank: 6\nranks: [7, 5, 6, 4]\ntp_degree: 2").unwrap();
    let config = TopologyConfig::load_yaml(file.path()).unwrap();

    let world = LocalWorld::new(8);
    let cache = Arc::new(CommGroupCache::new(Arc::new(world.endpoint(6).unwrap())));
    let topo = ProcessTopology::new(Arc::clone(&cache), &config).unwrap();

    assert_eq!(topo.ranks().unwrap(), &[4, 5, 6, 7]);
    assert_eq!(topo.row_ranks().unwrap(), &[6, 7]);
    assert_eq!(topo.col_ranks().unwrap(), &[4, 6]);
    assert_eq!(topo.axis_index(ParallelAxis::Tensor).unwrap(), 0);
    assert_eq!(topo.axis_index(ParallelAxis::Data).unwrap(), 1);
    assert!(cache.contains(&[4, 5], Backend::Primary));
    assert!(cache.contains(&[5, 7], Backend::Primary));
}

#[test]
fn test_overflowing_degrees_from_config_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "tp_degree: 18446744073709551615\ndp_degree: 2").unwrap();
    let config = TopologyConfig::load_yaml(file.path()).unwrap();

    let world = LocalWorld::new(4);
    let cache = Arc::new(CommGroupCache::new(Arc::new(world.endpoint(0).unwrap())));
    let err = ProcessTopology::new(Arc::clone(&cache), &config).unwrap_err();
    assert!(matches!(err, Error::DegreeMismatch { .. }));
    assert!(cache.is_empty());
}
