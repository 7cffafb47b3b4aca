//! Fixed, versioned, little-endian wire types for the redistribution protocols.
//!
//! Small fixed-shape messages (counts, coordinates, bounds, id replies) travel
//! as `Pod` records; whole meshes and trees travel as `bincode` buffers.

use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

use crate::mesh_error::MeshError;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a buffer of `T` records; the buffer may be unaligned.
pub fn decode_records<T: Pod>(bytes: &[u8], neighbor: usize) -> Result<Vec<T>, MeshError> {
    let sz = size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return Err(MeshError::BufferSizeMismatch {
            neighbor,
            expected: (bytes.len() / sz.max(1) + 1) * sz,
            got: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(sz)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}

/// Decode exactly one `T` record.
pub fn decode_one<T: Pod>(bytes: &[u8], neighbor: usize) -> Result<T, MeshError> {
    expect_exact_len(bytes.len(), size_of::<T>(), neighbor)?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

pub fn expect_exact_len(actual: usize, expected: usize, neighbor: usize) -> Result<(), MeshError> {
    if actual == expected {
        Ok(())
    } else {
        Err(MeshError::BufferSizeMismatch {
            neighbor,
            expected,
            got: actual,
        })
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// All multi-byte values in these structs are **little-endian** on the wire.
/// Floats travel as their IEEE-754 bit patterns.

// ===== Common records ======================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16, // = WIRE_VERSION.to_le()
    pub kind_le: u16,
    pub reserved_le: u32, // keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

/// Byte or item count preceding a variable-length payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A single `f64`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireF64 {
    pub bits_le: u64,
}
impl WireF64 {
    pub fn new(v: f64) -> Self {
        Self {
            bits_le: v.to_bits().to_le(),
        }
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.bits_le))
    }
}

/// A point coordinate triple.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCoord {
    pub xyz_le: [u64; 3],
}
impl WireCoord {
    pub fn new(p: [f64; 3]) -> Self {
        Self {
            xyz_le: p.map(|v| v.to_bits().to_le()),
        }
    }
    pub fn get(&self) -> [f64; 3] {
        self.xyz_le.map(|b| f64::from_bits(u64::from_le(b)))
    }
}

/// Axis-aligned box `(min, max)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireBounds {
    pub min: WireCoord,
    pub max: WireCoord,
}
impl WireBounds {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self {
            min: WireCoord::new(min),
            max: WireCoord::new(max),
        }
    }
    pub fn get(&self) -> ([f64; 3], [f64; 3]) {
        (self.min.get(), self.max.get())
    }
}

/// A global id (point or cell) carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireId {
    pub id_le: u64,
}
impl WireId {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

// ===== Distributed selection ===============================================

/// One worker's local partition of a selection range: `[lo, hi)` with the
/// first high value at `split`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireSplit {
    pub lo_le: u64,
    pub hi_le: u64,
    pub split_le: u64,
}
impl WireSplit {
    pub fn new(lo: usize, hi: usize, split: usize) -> Self {
        Self {
            lo_le: (lo as u64).to_le(),
            hi_le: (hi as u64).to_le(),
            split_le: (split as u64).to_le(),
        }
    }
    pub fn lo(&self) -> usize {
        u64::from_le(self.lo_le) as usize
    }
    pub fn hi(&self) -> usize {
        u64::from_le(self.hi_le) as usize
    }
    pub fn split(&self) -> usize {
        u64::from_le(self.split_le) as usize
    }
}

// ===== Global id reconciliation ============================================

pub const REPLY_ASSIGNED: u32 = 1;
pub const REPLY_PLACEHOLDER: u32 = 2;
pub const REPLY_MISSING: u32 = 3;

/// Owner's answer for one requested point coordinate.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIdReply {
    pub kind_le: u32,
    pub reserved_le: u32,
    pub value_le: u64,
}
impl WireIdReply {
    pub fn new(kind: u32, value: u64) -> Self {
        Self {
            kind_le: kind.to_le(),
            reserved_le: 0,
            value_le: value.to_le(),
        }
    }
    pub fn kind(&self) -> u32 {
        u32::from_le(self.kind_le)
    }
    pub fn value(&self) -> u64 {
        u64::from_le(self.value_le)
    }
}

// ===== Compile-time layout checks ==========================================

static_assertions::const_assert_eq!(size_of::<WireHdr>(), 8);
static_assertions::const_assert_eq!(size_of::<WireCount>(), 8);
static_assertions::const_assert_eq!(size_of::<WireF64>(), 8);
static_assertions::const_assert_eq!(size_of::<WireCoord>(), 24);
static_assertions::const_assert_eq!(size_of::<WireBounds>(), 48);
static_assertions::const_assert_eq!(size_of::<WireId>(), 8);
static_assertions::const_assert_eq!(size_of::<WireSplit>(), 24);
static_assertions::const_assert_eq!(size_of::<WireIdReply>(), 16);
static_assertions::const_assert!(align_of::<WireIdReply>() <= 8);
