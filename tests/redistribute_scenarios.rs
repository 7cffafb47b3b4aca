mod util;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mesh_redistribute::algs::exchange::TransferStrategy;
use mesh_redistribute::data::attributes::{GLOBAL_CELL_ID, GLOBAL_POINT_ID, INSIDE_REGION};
use mesh_redistribute::data::mesh::UnstructuredMesh;
use mesh_redistribute::mesh_error::MeshError;
use mesh_redistribute::prelude::*;
use mesh_redistribute::topology::cell_type::CellType;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use util::{assert_permutation, bricks, hex_grid, run_ranks, volume};

fn run_with(
    nprocs: usize,
    config: RedistributeConfig,
    input: impl Fn(usize) -> UnstructuredMesh + Sync,
) -> Vec<RedistributeOutput> {
    run_ranks(nprocs, |c| {
        let mesh = input(c.rank());
        Redistributor::new(config.clone()).run(&c, &mesh).unwrap()
    })
}

fn ids<'a>(m: &'a UnstructuredMesh, name: &str) -> &'a [i64] {
    m.cell_ids(name).unwrap().unwrap()
}

#[test]
fn four_workers_get_a_quarter_each() {
    let out = run_with(4, RedistributeConfig::default(), |me| {
        hex_grid(10, |c| c % 4 == me)
    });
    let mut all = Vec::new();
    for (me, o) in out.iter().enumerate() {
        let tree = o.tree.as_ref().unwrap();
        let own = o.ownership.as_ref().unwrap();
        assert_eq!(tree.region_count(), 4);
        assert_eq!(o.mesh.num_cells(), 250);
        for c in o.mesh.centroids() {
            assert_eq!(own.point_owner(tree, &c), Some(me));
        }
        assert!(o.mesh.cell_ghost_levels().is_none());
        assert!(o.warnings.is_empty());
        assert_eq!(o.array_ranges.cell_range("cell_id", 0), Some((0.0, 999.0)));
        all.extend_from_slice(ids(&o.mesh, "cell_id"));
    }
    assert_permutation(&all, &(0..1000).collect::<Vec<i64>>());
}

#[test]
fn octants_grow_two_ghost_levels() {
    let config = RedistributeConfig {
        ghost_level: 2,
        ..Default::default()
    };
    let out = run_with(8, config, |me| hex_grid(10, |c| c % 8 == me));
    for o in &out {
        let levels = o.mesh.cell_ghost_levels().unwrap();
        let count = |l: u8| levels.iter().filter(|&&x| x == l).count();
        // a 5^3 corner block grows to 6^3, then 7^3
        assert_eq!(o.mesh.num_cells(), 343);
        assert_eq!((count(0), count(1), count(2)), (125, 91, 127));
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));

        let points = o.mesh.point_ghost_levels().unwrap();
        assert_eq!(o.mesh.num_points(), 512);
        assert_eq!(points.iter().filter(|&&l| l == 0).count(), 216);
        assert_eq!(points.iter().filter(|&&l| l == 2).count(), 169);

        let cids = ids(&o.mesh, GLOBAL_CELL_ID);
        let distinct: BTreeSet<i64> = cids.iter().copied().collect();
        assert_eq!(distinct.len(), cids.len());
    }
}

fn cell_set(m: &UnstructuredMesh, keep: impl Fn(u8) -> bool) -> BTreeSet<i64> {
    let levels = m.cell_ghost_levels().unwrap();
    ids(m, GLOBAL_CELL_ID)
        .iter()
        .zip(levels)
        .filter(|&(_, &l)| keep(l))
        .map(|(&g, _)| g)
        .collect()
}

fn point_set(m: &UnstructuredMesh) -> BTreeSet<i64> {
    m.point_ids(GLOBAL_POINT_ID).unwrap().unwrap().iter().copied().collect()
}

#[test]
fn deeper_ghost_levels_extend_shallower_ones() {
    let with = |ghost_level| RedistributeConfig {
        ghost_level,
        ..Default::default()
    };
    let one = run_with(3, with(1), |me| hex_grid(6, |c| c % 3 == me));
    let two = run_with(3, with(2), |me| hex_grid(6, |c| c % 3 == me));
    for (a, b) in one.iter().zip(&two) {
        let shallow = cell_set(&a.mesh, |_| true);
        assert!(shallow.is_subset(&cell_set(&b.mesh, |_| true)));
        assert_eq!(shallow, cell_set(&b.mesh, |l| l <= 1));
        assert!(point_set(&a.mesh).is_subset(&point_set(&b.mesh)));

        // every level 2 cell touches a level 1 cell
        let m = &b.mesh;
        let levels = m.cell_ghost_levels().unwrap();
        let pids = m.point_ids(GLOBAL_POINT_ID).unwrap().unwrap();
        let level_one: BTreeSet<i64> = (0..m.num_cells())
            .filter(|&c| levels[c] == 1)
            .flat_map(|c| m.cell_points(c).iter().map(|&p| pids[p]))
            .collect();
        for c in (0..m.num_cells()).filter(|&c| levels[c] == 2) {
            assert!(m.cell_points(c).iter().any(|&p| level_one.contains(&pids[p])));
        }
    }
}

#[test]
fn global_ids_agree_across_workers() {
    let config = RedistributeConfig {
        ghost_level: 1,
        ..Default::default()
    };
    let out = run_with(3, config, |me| hex_grid(6, |c| c % 3 == me));

    let mut coords: BTreeMap<i64, [u64; 3]> = BTreeMap::new();
    let mut cells: BTreeMap<i64, i64> = BTreeMap::new();
    let mut owned = Vec::new();
    for o in &out {
        let m = &o.mesh;
        let pids = m.point_ids(GLOBAL_POINT_ID).unwrap().unwrap();
        for (p, &g) in pids.iter().enumerate() {
            let bits = m.point(p).map(f64::to_bits);
            assert_eq!(*coords.entry(g).or_insert(bits), bits, "point {g} moved");
        }
        let gids = ids(m, GLOBAL_CELL_ID);
        let grid = ids(m, "cell_id");
        let levels = m.cell_ghost_levels().unwrap();
        for c in 0..m.num_cells() {
            assert_eq!(*cells.entry(gids[c]).or_insert(grid[c]), grid[c]);
            if levels[c] == 0 {
                owned.push(gids[c]);
            }
        }
    }
    assert_eq!(coords.len(), 7 * 7 * 7);
    assert_eq!(cells.len(), 216);
    assert_permutation(&owned, &cells.keys().copied().collect::<Vec<_>>());
}

#[test]
fn lean_and_fast_transfers_agree() {
    let with = |strategy| RedistributeConfig {
        ghost_level: 1,
        transfer_strategy: strategy,
        boundary_policy: BoundaryPolicy::AssignToAllIntersectingRegions,
        ..Default::default()
    };
    let lean = run_with(4, with(TransferStrategy::Lean), |me| hex_grid(6, |c| c % 4 == me));
    let fast = run_with(4, with(TransferStrategy::Fast), |me| hex_grid(6, |c| c % 4 == me));
    for (a, b) in lean.iter().zip(&fast) {
        assert_eq!(ids(&a.mesh, "cell_id"), ids(&b.mesh, "cell_id"));
        assert_eq!(a.mesh.cell_ghost_levels(), b.mesh.cell_ghost_levels());
        assert_eq!(a.mesh.points(), b.mesh.points());
    }
}

#[test]
fn scattered_cells_are_conserved() {
    let mut rng = SmallRng::seed_from_u64(7);
    let holder: Vec<usize> = (0..216).map(|_| rng.gen_range(0..3)).collect();
    let input = |me: usize| hex_grid(6, |c| holder[c] == me);
    let all: Vec<i64> = (0..216).collect();

    let config = RedistributeConfig {
        global_cell_id_field: Some("cell_id".into()),
        ..Default::default()
    };
    let out = run_with(3, config, input);
    let got: Vec<i64> = out.iter().flat_map(|o| ids(&o.mesh, "cell_id").to_vec()).collect();
    assert_permutation(&got, &all);

    let config = RedistributeConfig {
        global_cell_id_field: Some("cell_id".into()),
        boundary_policy: BoundaryPolicy::AssignToAllIntersectingRegions,
        ..Default::default()
    };
    let out = run_with(3, config, input);
    let mut covered = BTreeSet::new();
    let mut copies = 0;
    for o in &out {
        let cids = ids(&o.mesh, "cell_id");
        let distinct: BTreeSet<i64> = cids.iter().copied().collect();
        assert_eq!(distinct.len(), cids.len(), "duplicate cell on one worker");
        copies += cids.len();
        covered.extend(distinct);
    }
    assert_eq!(covered, all.iter().copied().collect());
    assert!(copies >= 216);
}

#[test]
fn split_boundary_cells_conserve_volume() {
    let config = RedistributeConfig {
        boundary_policy: BoundaryPolicy::SplitBoundaryCells,
        ..Default::default()
    };
    // centroids 0.5, 2, 3.5, 5.5 split at 2.75, inside the second brick
    let out = run_with(2, config, |me| {
        if me == 0 {
            bricks(&[(0.0, 1.0), (1.0, 3.0)])
        } else {
            bricks(&[(3.0, 4.0), (4.0, 7.0)])
        }
    });
    let vols: Vec<f64> = out.iter().map(|o| volume(&o.mesh)).collect();
    assert!((vols[0] - 2.75).abs() < 1e-9, "{vols:?}");
    assert!((vols[1] - 4.25).abs() < 1e-9, "{vols:?}");
    assert_eq!(out[0].mesh.num_cells(), 2);
    assert_eq!(out[1].mesh.num_cells(), 3);
    for (me, o) in out.iter().enumerate() {
        let tree = o.tree.as_ref().unwrap();
        let region = tree.region_bounds(me).unwrap();
        for &p in o.mesh.points() {
            assert!(region.contains_closed(&p), "{p:?} outside {region:?}");
        }
        assert!(o.mesh.point_array(GLOBAL_POINT_ID).is_none());
        assert!(o.mesh.cell_array(INSIDE_REGION).is_none());
        assert!(o.warnings.is_empty());
    }
}

#[test]
fn split_cells_with_ghosts_mark_inside_fragments() {
    let config = RedistributeConfig {
        boundary_policy: BoundaryPolicy::SplitBoundaryCells,
        ghost_level: 1,
        ..Default::default()
    };
    let out = run_with(2, config, |me| {
        if me == 0 {
            bricks(&[(0.0, 1.0), (1.0, 3.0)])
        } else {
            bricks(&[(3.0, 4.0), (4.0, 7.0)])
        }
    });
    for o in &out {
        let inside = o.mesh.cell_array(INSIDE_REGION).unwrap().as_u8().unwrap();
        let levels = o.mesh.cell_ghost_levels().unwrap();
        for (i, l) in inside.iter().zip(levels) {
            assert_eq!(*i == 1, *l == 0);
        }
    }
    let inside_volume: f64 = out
        .iter()
        .map(|o| {
            let inside = o.mesh.cell_array(INSIDE_REGION).unwrap().as_u8().unwrap();
            (0..o.mesh.num_cells())
                .filter(|&c| inside[c] == 1)
                .map(|c| o.mesh.cell_volume(c).unwrap())
                .sum::<f64>()
        })
        .sum();
    assert!((inside_volume - 7.0).abs() < 1e-9);
}

#[test]
fn retained_tree_is_reused() {
    let out = run_ranks(2, |c| {
        let me = c.rank();
        let mesh = hex_grid(4, |cell| cell % 2 == me);
        let mut r = Redistributor::default();
        let first = r.run(&c, &mesh).unwrap().tree.unwrap();
        let second = r.run(&c, &mesh).unwrap().tree.unwrap();
        let reused = Arc::ptr_eq(&first, &second);

        r.set_config(RedistributeConfig {
            retain_partition_tree: false,
            ..Default::default()
        });
        let third = r.run(&c, &mesh).unwrap().tree.unwrap();
        (reused, Arc::ptr_eq(&second, &third), r.partition_tree().is_none(), *first == *third)
    });
    for (reused, kept, dropped, same) in out {
        assert!(reused);
        assert!(!kept);
        assert!(dropped);
        assert!(same);
    }
}

#[test]
fn coincident_centroids_warn_and_land_on_one_worker() {
    let out = run_with(2, RedistributeConfig::default(), |_| {
        let mut m = UnstructuredMesh::new();
        let p = m.add_point([1.0, 1.0, 1.0]);
        m.add_cell(CellType::Vertex, &[p]).unwrap();
        m.add_cell(CellType::Vertex, &[p]).unwrap();
        m
    });
    for o in &out {
        assert!(matches!(o.warnings[..], [MeshError::DegenerateGeometry(_)]));
        assert!(o.warnings.iter().all(MeshError::is_warning));
        assert_eq!(o.tree.as_ref().unwrap().region_count(), 1);
    }
    assert_eq!(out[0].mesh.num_cells(), 4);
    assert_eq!(out[0].mesh.num_points(), 1);
    assert_eq!(out[1].mesh.num_cells(), 0);
}

#[test]
fn empty_workers_are_filled_before_partitioning() {
    let out = run_with(3, RedistributeConfig::default(), |me| {
        if me == 1 { hex_grid(6, |_| true) } else { UnstructuredMesh::new() }
    });
    let total: usize = out.iter().map(|o| o.mesh.num_cells()).sum();
    assert_eq!(total, 216);
    assert!(out.iter().all(|o| o.mesh.num_cells() > 0));
}

#[test]
fn too_few_cells_fail_every_worker() {
    let out = run_ranks(3, |c| {
        let mesh = if c.rank() == 0 { bricks(&[(0.0, 1.0)]) } else { UnstructuredMesh::new() };
        Redistributor::default().run(&c, &mesh)
    });
    for r in out {
        assert!(matches!(
            r,
            Err(MeshError::InsufficientData {
                total: 1,
                workers: 3
            })
        ));
    }
}

#[test]
fn missing_caller_ids_fail_every_worker() {
    let out = run_ranks(2, |c| {
        let me = c.rank();
        let mut mesh = hex_grid(4, |cell| cell % 2 == me);
        if me == 1 {
            mesh.remove_cell_array("cell_id");
        }
        let config = RedistributeConfig {
            global_cell_id_field: Some("cell_id".into()),
            ..Default::default()
        };
        Redistributor::new(config).run(&c, &mesh)
    });
    assert!(matches!(out[0], Err(MeshError::RemoteFailure { .. })));
    assert!(matches!(out[1], Err(MeshError::MissingAttribute(_))));
}
