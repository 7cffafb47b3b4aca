//! Hash-grid point locator for coincident-point lookup.
//!
//! With a zero tolerance points match only when bit-identical; otherwise two
//! points match when their Euclidean distance is at most the tolerance.

use ahash::RandomState;
use hashbrown::HashMap;

/// Spatial hash of inserted points.
#[derive(Clone, Debug)]
pub struct PointLocator {
    tol: f64,
    cell: f64,
    grid: HashMap<[i64; 3], Vec<usize>, RandomState>,
    points: Vec<[f64; 3]>,
}

impl PointLocator {
    pub fn new(tolerance: f64) -> Self {
        let tol = if tolerance.is_finite() && tolerance > 0.0 {
            tolerance
        } else {
            0.0
        };
        Self {
            tol,
            cell: 2.0 * tol,
            grid: HashMap::with_hasher(RandomState::new()),
            points: Vec::new(),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tol
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, i: usize) -> [f64; 3] {
        self.points[i]
    }

    fn key(&self, p: &[f64; 3]) -> [i64; 3] {
        if self.tol == 0.0 {
            // -0.0 and 0.0 are the same location
            p.map(|x| if x == 0.0 { 0 } else { x.to_bits() as i64 })
        } else {
            p.map(|x| (x / self.cell).floor() as i64)
        }
    }

    /// Add `p` without looking for a match; returns its index.
    pub fn insert(&mut self, p: [f64; 3]) -> usize {
        let id = self.points.len();
        let key = self.key(&p);
        self.grid.entry(key).or_default().push(id);
        self.points.push(p);
        id
    }

    /// First inserted point matching `p`.
    pub fn find(&self, p: &[f64; 3]) -> Option<usize> {
        let key = self.key(p);
        if self.tol == 0.0 {
            return self
                .grid
                .get(&key)
                .and_then(|ids| ids.iter().copied().find(|&i| self.points[i] == *p));
        }
        let tol2 = self.tol * self.tol;
        let mut best: Option<usize> = None;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let k = [key[0] + dx, key[1] + dy, key[2] + dz];
                    let Some(ids) = self.grid.get(&k) else {
                        continue;
                    };
                    for &i in ids {
                        let q = self.points[i];
                        let d2 = (0..3).map(|d| (q[d] - p[d]).powi(2)).sum::<f64>();
                        if d2 <= tol2 && best.is_none_or(|b| i < b) {
                            best = Some(i);
                        }
                    }
                }
            }
        }
        best
    }

    /// Index of the point matching `p`, inserting it if absent.
    /// The flag is `true` when `p` was new.
    pub fn insert_unique(&mut self, p: [f64; 3]) -> (usize, bool) {
        match self.find(&p) {
            Some(i) => (i, false),
            None => (self.insert(p), true),
        }
    }
}
