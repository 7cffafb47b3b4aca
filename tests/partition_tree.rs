mod util;

use std::sync::Arc;

use mesh_redistribute::algs::communicator::{Communicator, NoComm};
use mesh_redistribute::geometry::bounds::Bounds;
use mesh_redistribute::partitioning::{
    AssignmentPolicy, PartitionConfig, PartitionTree, PartitionTreeBuilder, RegionCellCounts,
    X_AXIS, Y_AXIS, assign,
};
use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use util::{CountingComm, hex_grid, run_ranks};

fn config(regions: usize) -> PartitionConfig {
    PartitionConfig {
        min_cells_per_region: 2,
        regions_or_more: regions,
        ..Default::default()
    }
}

fn cloud(seed: u64, n: usize) -> Vec<[f64; 3]> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| [rng.r#gen::<f64>(), 10.0 * rng.r#gen::<f64>(), rng.gen_range(-2.0..2.0)])
        .collect()
}

fn leaves(tree: &PartitionTree) -> Vec<Bounds> {
    (0..tree.region_count())
        .map(|r| tree.region_bounds(r).unwrap())
        .collect()
}

proptest! {
    #[test]
    fn regions_claim_every_centroid_once(
        pts in proptest::collection::vec(
            (-5.0f64..5.0, -5.0f64..5.0, -5.0f64..5.0).prop_map(|(x, y, z)| [x, y, z]),
            4..120,
        ),
        regions in 1usize..9,
    ) {
        let mut b = PartitionTreeBuilder::new(config(regions));
        let tree = b.build(&NoComm, &pts, Bounds::from_points(&pts)).unwrap();
        tree.validate().unwrap();
        let boxes = leaves(&tree);
        for p in &pts {
            let claims = boxes.iter().filter(|b| b.contains(p)).count();
            prop_assert_eq!(claims, 1);
            let r = tree.region_containing(p).unwrap();
            prop_assert!(boxes[r].contains(p));
        }
        let counted: usize = (0..tree.region_count())
            .map(|r| tree.region(r).unwrap().point_count)
            .sum();
        prop_assert_eq!(counted, pts.len());
    }
}

#[test]
fn distributed_build_matches_serial_build() {
    let sizes = [40, 0, 75];
    let shards: Vec<Vec<[f64; 3]>> = sizes
        .iter()
        .enumerate()
        .map(|(r, &n)| cloud(r as u64, n))
        .collect();
    let all: Vec<[f64; 3]> = shards.iter().flatten().copied().collect();

    let serial = PartitionTreeBuilder::new(config(8))
        .build(&NoComm, &all, Bounds::from_points(&all))
        .unwrap();
    let trees = run_ranks(3, |c| {
        let mine = &shards[c.rank()];
        PartitionTreeBuilder::new(config(8))
            .build(&c, mine, Bounds::from_points(mine))
            .unwrap()
    });
    for t in &trees {
        assert_eq!(**t, *serial);
    }
    assert_eq!(serial.region_count(), 8);
    assert_eq!(serial.depth(), 3);
}

#[test]
fn worker_left_of_the_split_takes_part() {
    // rank 0 holds x in 0..5, rank 1 holds x in 5..20: the split at 10
    // leaves rank 0 with nothing above it
    let trees = run_ranks(2, |c| {
        let xs = if c.rank() == 0 { 0..5 } else { 5..20 };
        let pts: Vec<[f64; 3]> = xs.map(|x| [x as f64, 0.5, 0.5]).collect();
        PartitionTreeBuilder::new(config(2)).build(&c, &pts, Bounds::from_points(&pts))
    });
    let trees: Vec<_> = trees.into_iter().map(|t| t.unwrap()).collect();
    assert_eq!(*trees[0], *trees[1]);
    assert_eq!(trees[0].region_count(), 2);
    assert_eq!(trees[0].region(0).unwrap().point_count, 10);
    assert_eq!(trees[0].region(1).unwrap().point_count, 10);
    assert_eq!(trees[0].root().split.unwrap().dim, 0);
}

#[test]
fn splits_halve_the_centroids() {
    let pts = cloud(11, 256);
    let tree = PartitionTreeBuilder::new(config(4))
        .build(&NoComm, &pts, Bounds::from_points(&pts))
        .unwrap();
    for r in 0..4 {
        assert_eq!(tree.region(r).unwrap().point_count, 64);
    }
    // y has the widest spread
    assert_eq!(tree.root().split.unwrap().dim, 1);
}

#[test]
fn disabled_axes_are_never_split() {
    let pts = cloud(3, 100);
    let cfg = PartitionConfig {
        valid_split_dimensions: X_AXIS,
        ..config(4)
    };
    let tree = PartitionTreeBuilder::new(cfg)
        .build(&NoComm, &pts, Bounds::from_points(&pts))
        .unwrap();
    assert!(tree.nodes().iter().filter_map(|n| n.split).all(|s| s.dim == 0));

    let bad = PartitionConfig {
        valid_split_dimensions: 0,
        ..config(4)
    };
    assert!(PartitionTreeBuilder::new(bad)
        .build(&NoComm, &pts, Bounds::from_points(&pts))
        .is_err());
    let xy = PartitionConfig {
        valid_split_dimensions: X_AXIS | Y_AXIS,
        ..config(2)
    };
    assert!(xy.validate().is_ok());
}

#[test]
fn fewer_cells_than_workers_fail_everywhere() {
    let out = run_ranks(3, |c| {
        let pts = if c.rank() == 0 { vec![[0.0; 3]] } else { Vec::new() };
        PartitionTreeBuilder::new(config(3)).build(&c, &pts, Bounds::from_points(&pts))
    });
    assert!(out.iter().all(|r| r.is_err()));
}

#[test]
fn cached_tree_is_reused_without_messages() {
    run_ranks(2, |c| {
        let comm = CountingComm::new(c);
        let me = comm.rank();
        let mut mesh = hex_grid(4, |cell| cell % 2 == me);
        let mut b = PartitionTreeBuilder::new(config(2));

        let first = b.build_cached(&comm, &mesh).unwrap();
        let before = comm.messages();
        let again = b.build_cached(&comm, &mesh).unwrap();
        assert_eq!(comm.messages(), before);
        assert!(Arc::ptr_eq(&first, &again));

        mesh.add_point([9.0, 9.0, 9.0]);
        let rebuilt = b.build_cached(&comm, &mesh).unwrap();
        assert!(comm.messages() > before);
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    });
}

#[test]
fn region_counts_and_assignment_agree() {
    let out = run_ranks(2, |c| {
        let me = c.rank();
        let mesh = hex_grid(4, |cell| cell % 2 == me);
        let mut b = PartitionTreeBuilder::new(config(4));
        let tree = b.build_cached(&c, &mesh).unwrap();
        let local = RegionCellCounts::local_counts(&tree, &mesh.centroids());
        let counts = RegionCellCounts::gather(&c, &local).unwrap();
        let own = assign(&tree, &AssignmentPolicy::Contiguous, 2).unwrap();
        (tree.region_count(), counts, own)
    });
    let (regions, counts, own) = &out[0];
    assert_eq!(*regions, 4);
    let total: usize = (0..*regions).map(|r| counts.total_cells(r)).sum();
    assert_eq!(total, 64);
    for r in 0..*regions {
        assert_eq!(counts.total_cells(r), 16);
        assert_eq!(counts.workers_with_data(r), vec![0, 1]);
    }
    assert_eq!(own.regions_owned_by(0), &[0, 1]);
    assert_eq!(own.regions_owned_by(1), &[2, 3]);
}
