//! Key and value layouts for the per-interface forwarding maps.
//!
//! This crate is `no_std` so it can be compiled for both targets:
//! - `bpfel-unknown-none` (kernel-side XDP program)
//! - the host target (userspace control plane in `vmark-ebpf`)
//!
//! The structs here are the map ABI: field order, widths and padding are
//! shared with the data-plane program and must be preserved bit-for-bit.
//! Multi-byte fields are in host byte order on both sides of the map.
//!
//! Enable the `aya-pod` feature in the userspace crate to get the
//! `aya::Pod` impls required for typed map access.
#![no_std]

/// Step types understood by the data-plane program.
pub mod action {
    pub const FORWARD: u8 = 1;
    pub const PUSH: u8 = 2;
    pub const POP: u8 = 3;
}

/// Tag types carried by PUSH steps. POP and FORWARD steps use `NONE`.
pub mod tag {
    pub const NONE: u8 = 0;
    pub const CVLAN: u8 = 1;
    pub const SVLAN: u8 = 2;
}

/// Maximum number of steps a single map value can carry.
pub const MAX_STEPS: usize = 5;

/// Minimum number of entries each per-interface forwarding map must hold.
pub const FW_TABLE_CAPACITY: u32 = 4096;

/// Lookup key for a per-interface forwarding map.
///
/// **Layout must match `struct fw_key` in the XDP program exactly**
/// (both `#[repr(C)]`, 16 bytes, no implicit padding).
///
/// ```text
/// offset  0: ingress_ifindex  u32
/// offset  4: vlan_id          u16  (C-VLAN / single tag; 0 = untagged)
/// offset  6: svlan_id         u16  (S-VLAN; 0 = no outer tag)
/// offset  8: bmac             [u8; 6]  (reserved for PBB, zero-filled)
/// offset 14: _pad             [u8; 2]
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FwKey {
    pub ingress_ifindex: u32,
    pub vlan_id: u16,
    pub svlan_id: u16,
    pub bmac: [u8; 6],
    pub _pad: [u8; 2],
}

impl FwKey {
    pub const LEN: usize = 16;

    pub const fn new(ingress_ifindex: u32, vlan_id: u16, svlan_id: u16) -> Self {
        Self { ingress_ifindex, vlan_id, svlan_id, bmac: [0; 6], _pad: [0; 2] }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.ingress_ifindex.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.vlan_id.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.svlan_id.to_ne_bytes());
        buf[8..14].copy_from_slice(&self.bmac);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::LEN]) -> Self {
        let mut bmac = [0u8; 6];
        bmac.copy_from_slice(&buf[8..14]);
        Self {
            ingress_ifindex: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            vlan_id: u16::from_ne_bytes([buf[4], buf[5]]),
            svlan_id: u16::from_ne_bytes([buf[6], buf[7]]),
            bmac,
            _pad: [0; 2],
        }
    }
}

impl Default for FwKey {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

/// One forwarding step.
///
/// ```text
/// offset 0: action          u8   (action::FORWARD / PUSH / POP)
/// offset 1: tag_type        u8   (tag::NONE / CVLAN / SVLAN)
/// offset 2: vlan_id         u16  (PUSH only; 0 otherwise)
/// offset 4: target_ifindex  u32  (FORWARD only; 0 otherwise)
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FwStep {
    pub action: u8,
    pub tag_type: u8,
    pub vlan_id: u16,
    pub target_ifindex: u32,
}

impl FwStep {
    pub const LEN: usize = 8;

    pub const fn pop() -> Self {
        Self { action: action::POP, tag_type: tag::NONE, vlan_id: 0, target_ifindex: 0 }
    }

    pub const fn push(tag_type: u8, vlan_id: u16) -> Self {
        Self { action: action::PUSH, tag_type, vlan_id, target_ifindex: 0 }
    }

    pub const fn forward(target_ifindex: u32) -> Self {
        Self { action: action::FORWARD, tag_type: tag::NONE, vlan_id: 0, target_ifindex }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.action;
        buf[1] = self.tag_type;
        buf[2..4].copy_from_slice(&self.vlan_id.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.target_ifindex.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::LEN]) -> Self {
        Self {
            action: buf[0],
            tag_type: buf[1],
            vlan_id: u16::from_ne_bytes([buf[2], buf[3]]),
            target_ifindex: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Action list stored under a [`FwKey`].
///
/// **Layout must match `struct fw_value` in the XDP program exactly.**
/// The kernel struct is packed: the step array starts at offset 1, so the
/// Rust mirror is `repr(C, packed)` — 50 bytes total. Fields of a packed
/// struct must be copied out before use; the accessors below do that.
///
/// ```text
/// offset  0: num_actions  u8
/// offset  1: steps        [FwStep; 5]
/// offset 41: _pad         [u8; 9]
/// ```
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FwValue {
    pub num_actions: u8,
    pub steps: [FwStep; MAX_STEPS],
    pub _pad: [u8; 9],
}

impl FwValue {
    pub const LEN: usize = 50;

    /// Build a value from a step slice. Returns `None` if the slice
    /// exceeds [`MAX_STEPS`].
    ///
    /// The array is assembled before construction: references into a
    /// packed struct are unaligned and not allowed.
    pub fn from_steps(steps: &[FwStep]) -> Option<Self> {
        if steps.len() > MAX_STEPS {
            return None;
        }
        let mut slots = [FwStep::default(); MAX_STEPS];
        for (slot, step) in slots.iter_mut().zip(steps.iter()) {
            *slot = *step;
        }
        Some(Self { num_actions: steps.len() as u8, steps: slots, _pad: [0; 9] })
    }

    /// The populated steps, copied out of the packed struct.
    pub fn active_steps(&self) -> [FwStep; MAX_STEPS] {
        let steps = self.steps;
        steps
    }

    pub fn num_actions(&self) -> usize {
        let n = self.num_actions;
        (n as usize).min(MAX_STEPS)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.num_actions;
        let steps = self.steps;
        for (i, step) in steps.iter().enumerate() {
            let off = 1 + i * FwStep::LEN;
            buf[off..off + FwStep::LEN].copy_from_slice(&step.to_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::LEN]) -> Self {
        let mut steps = [FwStep::default(); MAX_STEPS];
        for (i, step) in steps.iter_mut().enumerate() {
            let off = 1 + i * FwStep::LEN;
            let mut raw = [0u8; FwStep::LEN];
            raw.copy_from_slice(&buf[off..off + FwStep::LEN]);
            *step = FwStep::from_bytes(&raw);
        }
        Self { num_actions: buf[0], steps, _pad: [0; 9] }
    }
}

impl Default for FwValue {
    fn default() -> Self {
        Self { num_actions: 0, steps: [FwStep::default(); MAX_STEPS], _pad: [0; 9] }
    }
}

/// Implement `aya::Pod` so the userspace control plane can use these types
/// directly as map keys and values. Only compiled with the `aya-pod`
/// feature (i.e. in the userspace crate, never for the BPF target).
///
/// SAFETY: both types are `Copy`, fully initialized, with no implicit
/// padding — `FwKey` is `repr(C)` with explicit tail padding, `FwValue`
/// is `repr(C, packed)`.
#[cfg(feature = "aya-pod")]
#[allow(unsafe_code)]
mod pod {
    unsafe impl aya::Pod for super::FwKey {}
    unsafe impl aya::Pod for super::FwValue {}
}
