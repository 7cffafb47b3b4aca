//! Axis-aligned boxes and the two membership predicates used by the
//! partition: upper-inclusive [`Bounds::contains`] for region ownership and
//! [`Bounds::strictly_contains`] for "not on any face".

use serde::{Deserialize, Serialize};

/// Axis-aligned box `[min, max]`. An empty box has `min > max`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for Bounds {
    fn default() -> Self {
        Self::empty()
    }
}

impl Bounds {
    pub const fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Inverted box; the identity for [`extend`](Self::extend) and [`union`](Self::union).
    pub const fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    pub fn from_points<'a>(pts: impl IntoIterator<Item = &'a [f64; 3]>) -> Self {
        let mut b = Self::empty();
        for p in pts {
            b.extend(p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|d| self.min[d] > self.max[d])
    }

    pub fn extend(&mut self, p: &[f64; 3]) {
        for d in 0..3 {
            self.min[d] = self.min[d].min(p[d]);
            self.max[d] = self.max[d].max(p[d]);
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        let mut b = *self;
        for d in 0..3 {
            b.min[d] = b.min[d].min(other.min[d]);
            b.max[d] = b.max[d].max(other.max[d]);
        }
        b
    }

    pub fn extent(&self, dim: usize) -> f64 {
        self.max[dim] - self.min[dim]
    }

    pub fn max_extent(&self) -> f64 {
        (0..3).map(|d| self.extent(d)).fold(0.0, f64::max)
    }

    pub fn center(&self) -> [f64; 3] {
        [0, 1, 2].map(|d| 0.5 * (self.min[d] + self.max[d]))
    }

    pub fn volume(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            (0..3).map(|d| self.extent(d)).product()
        }
    }

    /// Region membership: `min < x <= max` on every axis.
    ///
    /// Lower faces are exclusive and upper faces inclusive, so boxes that
    /// tile space claim every point exactly once.
    pub fn contains(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|d| p[d] > self.min[d] && p[d] <= self.max[d])
    }

    /// Interior test: `min < x < max` on every axis.
    pub fn strictly_contains(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|d| p[d] > self.min[d] && p[d] < self.max[d])
    }

    /// Closed test: `min <= x <= max` on every axis.
    pub fn contains_closed(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|d| p[d] >= self.min[d] && p[d] <= self.max[d])
    }

    /// Overlap of the two closed boxes, if any.
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let mut b = *self;
        for d in 0..3 {
            b.min[d] = self.min[d].max(other.min[d]);
            b.max[d] = self.max[d].min(other.max[d]);
            if b.min[d] > b.max[d] {
                return None;
            }
        }
        Some(b)
    }

    /// Whether the boxes share interior volume. Along an axis where either
    /// box is flat, touching counts as overlap.
    pub fn overlaps(&self, other: &Bounds) -> bool {
        (0..3).all(|d| {
            let lo = self.min[d].max(other.min[d]);
            let hi = self.max[d].min(other.max[d]);
            if self.extent(d) > 0.0 && other.extent(d) > 0.0 {
                lo < hi
            } else {
                lo <= hi
            }
        })
    }
}
