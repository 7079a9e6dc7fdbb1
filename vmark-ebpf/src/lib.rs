// eBPF/XDP is Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]

pub mod binding;

pub use binding::XdpDataplane;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EbpfError {
    #[error("failed to read BPF object {path}: {source}")]
    ObjectRead { path: PathBuf, source: std::io::Error },

    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("XDP program 'vmark_xdp_switch' not found in BPF object")]
    ProgramNotFound,

    #[error("BPF program is not an XDP program: {0}")]
    ProgramType(#[source] aya::programs::ProgramError),

    #[error("failed to load XDP program into kernel: {0}")]
    ProgramLoad(#[source] aya::programs::ProgramError),

    #[error("failed to attach XDP program to interface: {0}")]
    Attach(#[source] aya::programs::ProgramError),

    #[error("forwarding map 'fw_table' not found in BPF object")]
    MapNotFound,

    #[error("failed to pin {what} at {path}: {message}")]
    Pin { what: &'static str, path: PathBuf, message: String },

    #[error("failed to open pinned map {path}: {message}")]
    MapOpen { path: PathBuf, message: String },

    #[error("map operation '{op}' failed: {message}")]
    MapOp { op: &'static str, message: String },

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("{op} on '{iface}' failed: {source}")]
    Ioctl { op: &'static str, iface: String, source: std::io::Error },
}
