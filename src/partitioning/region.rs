//! The spatial partition tree: an arena of axis-aligned regions.
//!
//! Node 0 is the root. Internal nodes carry a [`Split`]; leaves carry a
//! region id. Region ids are dense and assigned depth first, so every
//! subtree covers the contiguous id range `min_id..=max_id`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::bounds::Bounds;
use crate::mesh_error::MeshError;

/// Bit for the x axis in a split-dimension mask.
pub const X_AXIS: u8 = 1;
/// Bit for the y axis in a split-dimension mask.
pub const Y_AXIS: u8 = 2;
/// Bit for the z axis in a split-dimension mask.
pub const Z_AXIS: u8 = 4;
/// All three axes.
pub const ALL_AXES: u8 = X_AXIS | Y_AXIS | Z_AXIS;

/// Where an internal node divides its box.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub dim: usize,
    pub coord: f64,
}

/// One node of the partition tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Box claimed by this node (lower faces exclusive, upper inclusive).
    pub bounds: Bounds,
    /// Tight box of the centroids that fell in this node during the build.
    pub data_bounds: Bounds,
    pub split: Option<Split>,
    pub parent: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub level: usize,
    /// Centroids counted in this node during the build.
    pub point_count: usize,
    /// Region id, for leaves only.
    pub id: Option<usize>,
    /// Smallest region id under this node.
    pub min_id: usize,
    /// Largest region id under this node.
    pub max_id: usize,
}

impl Region {
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

/// A node as one worker saw it during the distributed build, keyed by its
/// heap position (root 1, children `2k` and `2k + 1`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentNode {
    pub key: u64,
    pub level: usize,
    pub bounds: Bounds,
    pub data_bounds: Bounds,
    pub point_count: usize,
    pub split: Option<Split>,
}

/// Balanced binary spatial decomposition shared by all workers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionTree {
    nodes: Vec<Region>,
    leaves: Vec<usize>,
    depth: usize,
    /// Lower-face widening applied to the volume; also the point merge tolerance.
    #[serde(default)]
    fudge: f64,
}

impl PartitionTree {
    /// A one-region tree covering `bounds`.
    pub fn single(bounds: Bounds, data_bounds: Bounds, point_count: usize) -> Self {
        Self::from_fragments(
            bounds,
            &[FragmentNode {
                key: 1,
                level: 0,
                bounds,
                data_bounds,
                point_count,
                split: None,
            }],
        )
    }

    /// Assemble a complete tree from build fragments.
    ///
    /// The first fragment for a key wins. A split node whose children
    /// nobody reported becomes a leaf. Boundaries are repaired top down,
    /// then leaves are numbered.
    pub fn from_fragments(volume: Bounds, fragments: &[FragmentNode]) -> Self {
        let mut by_key: std::collections::BTreeMap<u64, &FragmentNode> = Default::default();
        for f in fragments {
            by_key.entry(f.key).or_insert(f);
        }

        let mut tree = PartitionTree {
            nodes: Vec::new(),
            leaves: Vec::new(),
            depth: 0,
            fudge: 0.0,
        };
        let root = match by_key.get(&1) {
            Some(f) => (*f).clone(),
            None => FragmentNode {
                key: 1,
                level: 0,
                bounds: volume,
                data_bounds: Bounds::empty(),
                point_count: 0,
                split: None,
            },
        };
        tree.push_subtree(&by_key, &root, None);
        tree.repair_boundaries();
        tree.number_leaves();
        tree
    }

    fn push_subtree(
        &mut self,
        by_key: &std::collections::BTreeMap<u64, &FragmentNode>,
        f: &FragmentNode,
        parent: Option<usize>,
    ) -> usize {
        let idx = self.nodes.len();
        let children = f.split.and_then(|_| {
            let l = by_key.get(&(2 * f.key))?;
            let r = by_key.get(&(2 * f.key + 1))?;
            Some((*l, *r))
        });
        self.nodes.push(Region {
            bounds: f.bounds,
            data_bounds: f.data_bounds,
            split: children.and(f.split),
            parent,
            left: None,
            right: None,
            level: f.level,
            point_count: f.point_count,
            id: None,
            min_id: 0,
            max_id: 0,
        });
        if let Some((l, r)) = children {
            let li = self.push_subtree(by_key, l, Some(idx));
            let ri = self.push_subtree(by_key, r, Some(idx));
            self.nodes[idx].left = Some(li);
            self.nodes[idx].right = Some(ri);
        }
        idx
    }

    /// Make every child's box tile its parent exactly: the split face of
    /// both children is the split coordinate, all other faces the parent's.
    fn repair_boundaries(&mut self) {
        for idx in 0..self.nodes.len() {
            let (Some(split), Some(l), Some(r)) = (
                self.nodes[idx].split,
                self.nodes[idx].left,
                self.nodes[idx].right,
            ) else {
                continue;
            };
            let parent = self.nodes[idx].bounds;
            let mut lb = parent;
            let mut rb = parent;
            lb.max[split.dim] = split.coord;
            rb.min[split.dim] = split.coord;
            self.nodes[l].bounds = lb;
            self.nodes[r].bounds = rb;
        }
    }

    fn number_leaves(&mut self) {
        self.leaves.clear();
        self.depth = 0;
        if !self.nodes.is_empty() {
            self.number_from(0);
        }
    }

    fn number_from(&mut self, idx: usize) -> (usize, usize) {
        let node = &self.nodes[idx];
        self.depth = self.depth.max(node.level);
        let range = match (node.left, node.right) {
            (Some(l), Some(r)) => {
                let (lo, _) = self.number_from(l);
                let (_, hi) = self.number_from(r);
                (lo, hi)
            }
            _ => {
                let id = self.leaves.len();
                self.leaves.push(idx);
                self.nodes[idx].id = Some(id);
                (id, id)
            }
        };
        self.nodes[idx].min_id = range.0;
        self.nodes[idx].max_id = range.1;
        range
    }

    // ----- queries -----

    pub fn region_count(&self) -> usize {
        self.leaves.len()
    }

    /// Level of the deepest leaf (0 for a single region).
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn fudge(&self) -> f64 {
        self.fudge
    }

    pub(crate) fn set_fudge(&mut self, fudge: f64) {
        self.fudge = fudge;
    }

    pub fn root(&self) -> &Region {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[Region] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &Region {
        &self.nodes[idx]
    }

    /// Arena index of the leaf with region id `id`.
    pub fn leaf_node(&self, id: usize) -> Option<usize> {
        self.leaves.get(id).copied()
    }

    pub fn region(&self, id: usize) -> Result<&Region, MeshError> {
        self.leaf_node(id)
            .map(|i| &self.nodes[i])
            .ok_or_else(|| {
                MeshError::Configuration(format!(
                    "region {id} out of range ({} regions)",
                    self.region_count()
                ))
            })
    }

    pub fn region_bounds(&self, id: usize) -> Result<Bounds, MeshError> {
        Ok(self.region(id)?.bounds)
    }

    pub fn region_data_bounds(&self, id: usize) -> Result<Bounds, MeshError> {
        Ok(self.region(id)?.data_bounds)
    }

    /// Region whose box claims `p`, or `None` outside the partitioned volume.
    pub fn region_containing(&self, p: &[f64; 3]) -> Option<usize> {
        if self.nodes.is_empty() || !self.root().bounds.contains(p) {
            return None;
        }
        Some(self.locate(p))
    }

    /// Region `p` falls in when descending the splits, even if `p` lies
    /// outside the root box.
    pub fn locate(&self, p: &[f64; 3]) -> usize {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            match (node.split, node.left, node.right) {
                (Some(s), Some(l), Some(r)) => {
                    idx = if p[s.dim] <= s.coord { l } else { r };
                }
                _ => return node.id.unwrap_or(0),
            }
        }
    }

    /// Regions whose boxes share volume with `b`, ascending.
    pub fn regions_intersecting(&self, b: &Bounds) -> Vec<usize> {
        let mut out = Vec::new();
        if self.nodes.is_empty() {
            return out;
        }
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.bounds.overlaps(b) {
                continue;
            }
            match (node.left, node.right) {
                (Some(l), Some(r)) => {
                    stack.push(r);
                    stack.push(l);
                }
                _ => out.extend(node.id),
            }
        }
        out
    }

    /// Fewest boxes whose union is exactly the union of `ids`.
    ///
    /// A subtree whose whole id range is requested contributes its own box.
    pub fn minimal_convex_sub_regions(&self, ids: &[usize]) -> Vec<Bounds> {
        let mut wanted: Vec<usize> = ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        let mut out = Vec::new();
        if !self.nodes.is_empty() {
            self.convex_from(0, &wanted, &mut out);
        }
        out
    }

    fn convex_from(&self, idx: usize, wanted: &[usize], out: &mut Vec<Bounds>) {
        let node = &self.nodes[idx];
        let lo = wanted.partition_point(|&i| i < node.min_id);
        let hi = wanted.partition_point(|&i| i <= node.max_id);
        let present = hi - lo;
        if present == 0 {
            return;
        }
        if present == node.max_id - node.min_id + 1 {
            out.push(node.bounds);
            return;
        }
        if let (Some(l), Some(r)) = (node.left, node.right) {
            self.convex_from(l, wanted, out);
            self.convex_from(r, wanted, out);
        }
    }

    /// Arena indices of the nodes at `level`, left to right, or `None` if
    /// some branch ends above it.
    pub fn nodes_at_level(&self, level: usize) -> Option<Vec<usize>> {
        let mut frontier = vec![0];
        for _ in 0..level {
            let mut next = Vec::with_capacity(frontier.len() * 2);
            for idx in frontier {
                let node = &self.nodes[idx];
                next.push(node.left?);
                next.push(node.right?);
            }
            frontier = next;
        }
        Some(frontier)
    }

    /// Check the tiling and numbering invariants.
    pub fn validate(&self) -> Result<(), MeshError> {
        let bad = |msg: String| Err(MeshError::Configuration(msg));
        for (idx, node) in self.nodes.iter().enumerate() {
            if let (Some(s), Some(l), Some(r)) = (node.split, node.left, node.right) {
                let (lb, rb) = (self.nodes[l].bounds, self.nodes[r].bounds);
                for d in 0..3 {
                    let expect_l = (node.bounds.min[d], if d == s.dim { s.coord } else { node.bounds.max[d] });
                    let expect_r = (if d == s.dim { s.coord } else { node.bounds.min[d] }, node.bounds.max[d]);
                    if (lb.min[d], lb.max[d]) != expect_l || (rb.min[d], rb.max[d]) != expect_r {
                        return bad(format!("children of node {idx} do not tile it on axis {d}"));
                    }
                }
                if self.nodes[l].max_id + 1 != self.nodes[r].min_id {
                    return bad(format!("children of node {idx} have non-contiguous ids"));
                }
            } else if node.id.is_none() {
                return bad(format!("leaf node {idx} has no region id"));
            }
        }
        for (id, &idx) in self.leaves.iter().enumerate() {
            if self.nodes[idx].id != Some(id) {
                return bad(format!("region {id} is misnumbered"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for PartitionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "partition tree: {} regions, depth {}",
            self.region_count(),
            self.depth
        )?;
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let Some(node) = self.nodes.get(idx) else {
                break;
            };
            let indent = "  ".repeat(node.level);
            match (node.split, node.left, node.right) {
                (Some(s), Some(l), Some(r)) => {
                    writeln!(
                        f,
                        "{indent}split axis {} at {:.6} ({} pts, ids {}..={})",
                        s.dim, s.coord, node.point_count, node.min_id, node.max_id
                    )?;
                    stack.push(r);
                    stack.push(l);
                }
                _ => writeln!(
                    f,
                    "{indent}region {} {:?}..{:?} ({} pts)",
                    node.id.unwrap_or(0),
                    node.bounds.min,
                    node.bounds.max,
                    node.point_count
                )?,
            }
        }
        Ok(())
    }
}
