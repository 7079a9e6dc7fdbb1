use std::collections::HashMap;

use vmark_ebpf_common::{FwKey, FwValue};

use crate::error::{NodeError, Result};

/// Kernel operations the control plane needs. The XDP implementation
/// lives in `vmark-ebpf`; [`MemoryDataplane`] backs tests and platforms
/// without XDP support.
///
/// The reconciler is the only caller that issues writes through this
/// trait. `attach`/`detach` are idempotent; `detach` also deletes the
/// interface's map.
pub trait Dataplane: Send {
    /// Resolve an OS interface name to its ifindex.
    fn resolve_ifindex(&mut self, name: &str) -> Result<u32>;

    /// Attach the data-plane program to an interface and enable
    /// promiscuous mode. No-op when already attached.
    fn attach(&mut self, iface: &str, ifindex: u32) -> Result<()>;

    /// Remove the program, delete the interface map and disable
    /// promiscuous mode. No-op when not attached.
    fn detach(&mut self, ifindex: u32) -> Result<()>;

    /// Create the per-interface forwarding map if absent.
    fn ensure_map(&mut self, ifindex: u32) -> Result<()>;

    fn map_put(&mut self, ifindex: u32, key: FwKey, value: FwValue) -> Result<()>;

    fn map_delete(&mut self, ifindex: u32, key: FwKey) -> Result<()>;

    fn map_clear(&mut self, ifindex: u32) -> Result<()>;

    /// Current entries of the interface map.
    fn map_entries(&self, ifindex: u32) -> Result<Vec<(FwKey, FwValue)>>;

    /// Ifindexes the program is currently attached to.
    fn attached(&self) -> Result<Vec<u32>>;
}

/// In-memory [`Dataplane`]: a fixed interface set for tests, or
/// permissive auto-registration when running without XDP support.
#[derive(Debug, Default)]
pub struct MemoryDataplane {
    interfaces: HashMap<String, u32>,
    permissive: bool,
    next_ifindex: u32,
    attached: HashMap<u32, String>,
    maps: HashMap<u32, HashMap<FwKey, FwValue>>,
    fail_map_ops: bool,
}

impl MemoryDataplane {
    pub fn with_interfaces(pairs: &[(&str, u32)]) -> Self {
        Self {
            interfaces: pairs.iter().map(|(n, i)| (n.to_string(), *i)).collect(),
            next_ifindex: pairs.iter().map(|(_, i)| *i).max().unwrap_or(0) + 1,
            ..Default::default()
        }
    }

    /// Any interface name resolves; indexes are assigned on first use.
    pub fn permissive() -> Self {
        Self { permissive: true, next_ifindex: 1, ..Default::default() }
    }

    pub fn add_interface(&mut self, name: &str, ifindex: u32) {
        self.interfaces.insert(name.to_string(), ifindex);
    }

    /// Simulate an interface disappearing (its map state goes with it).
    pub fn remove_interface(&mut self, name: &str) {
        if let Some(ifindex) = self.interfaces.remove(name) {
            self.attached.remove(&ifindex);
            self.maps.remove(&ifindex);
        }
    }

    /// Make subsequent map writes fail with a kernel error, for rollback
    /// testing.
    pub fn set_fail_map_ops(&mut self, fail: bool) {
        self.fail_map_ops = fail;
    }

    pub fn is_attached(&self, ifindex: u32) -> bool {
        self.attached.contains_key(&ifindex)
    }

    pub fn map_snapshot(&self, ifindex: u32) -> Option<&HashMap<FwKey, FwValue>> {
        self.maps.get(&ifindex)
    }

    fn map_mut(&mut self, ifindex: u32) -> Result<&mut HashMap<FwKey, FwValue>> {
        if self.fail_map_ops {
            return Err(NodeError::kernel("bpf_map_update_elem", "injected failure"));
        }
        self.maps
            .get_mut(&ifindex)
            .ok_or_else(|| NodeError::kernel("bpf_map_lookup", format!("no map for ifindex {ifindex}")))
    }
}

impl Dataplane for MemoryDataplane {
    fn resolve_ifindex(&mut self, name: &str) -> Result<u32> {
        if let Some(ifindex) = self.interfaces.get(name) {
            return Ok(*ifindex);
        }
        if self.permissive {
            let ifindex = self.next_ifindex;
            self.next_ifindex += 1;
            self.interfaces.insert(name.to_string(), ifindex);
            return Ok(ifindex);
        }
        Err(NodeError::NotFound(format!("interface '{name}'")))
    }

    fn attach(&mut self, iface: &str, ifindex: u32) -> Result<()> {
        self.attached.entry(ifindex).or_insert_with(|| iface.to_string());
        Ok(())
    }

    fn detach(&mut self, ifindex: u32) -> Result<()> {
        self.attached.remove(&ifindex);
        self.maps.remove(&ifindex);
        Ok(())
    }

    fn ensure_map(&mut self, ifindex: u32) -> Result<()> {
        self.maps.entry(ifindex).or_default();
        Ok(())
    }

    fn map_put(&mut self, ifindex: u32, key: FwKey, value: FwValue) -> Result<()> {
        self.map_mut(ifindex)?.insert(key, value);
        Ok(())
    }

    fn map_delete(&mut self, ifindex: u32, key: FwKey) -> Result<()> {
        self.map_mut(ifindex)?.remove(&key);
        Ok(())
    }

    fn map_clear(&mut self, ifindex: u32) -> Result<()> {
        self.map_mut(ifindex)?.clear();
        Ok(())
    }

    fn map_entries(&self, ifindex: u32) -> Result<Vec<(FwKey, FwValue)>> {
        Ok(self
            .maps
            .get(&ifindex)
            .map(|m| m.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default())
    }

    fn attached(&self) -> Result<Vec<u32>> {
        Ok(self.attached.keys().copied().collect())
    }
}
