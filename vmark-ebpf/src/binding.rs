//! XDP implementation of the control plane's [`Dataplane`] trait.
//!
//! One data-plane program instance runs per ingress interface, each with
//! its own `fw_table_<iface>` hash map. Program links and maps are pinned
//! under a bpffs directory so the forwarding state survives process exit;
//! every operation works off the pin files rather than a resident handle.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use aya::maps::{HashMap as BpfHashMap, Map, MapData};
use aya::programs::links::FdLink;
use aya::programs::{Xdp, XdpFlags};
use aya::EbpfLoader;
use tracing::{debug, info, warn};
use vmark_ebpf_common::{FwKey, FwValue, FW_TABLE_CAPACITY};
use vmark_lib::error::{NodeError, Result};
use vmark_lib::forwarding::Dataplane;

use crate::EbpfError;

/// Environment variable overriding the BPF object location.
pub const OBJECT_PATH_ENV: &str = "VMARK_XDP_OBJECT";

/// Default location of the compiled data-plane object.
pub const DEFAULT_OBJECT_PATH: &str = "/usr/lib/vmark/vmark_xdp.o";

/// Default bpffs directory for pinned links and maps.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/vmark";

const PROGRAM_NAME: &str = "vmark_xdp_switch";
const MAP_NAME: &str = "fw_table";

pub struct XdpDataplane {
    object_path: PathBuf,
    pin_dir: PathBuf,
    /// ifindex -> interface name for interfaces seen attached.
    ifaces: HashMap<u32, String>,
}

impl XdpDataplane {
    /// Open the dataplane rooted at a bpffs pin directory. Lifts the
    /// memlock rlimit so BPF maps can be created without a configured
    /// `ulimits: memlock: -1` in the deployment environment.
    pub fn new(object_path: impl Into<PathBuf>, pin_dir: impl Into<PathBuf>) -> Result<Self> {
        #[allow(unsafe_code)]
        unsafe {
            let rlim =
                libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
            let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
        }

        let pin_dir = pin_dir.into();
        fs::create_dir_all(&pin_dir).map_err(|e| convert_io("mkdir", &pin_dir, e))?;
        let mut dp = Self { object_path: object_path.into(), pin_dir, ifaces: HashMap::new() };
        dp.refresh_iface_cache();
        Ok(dp)
    }

    /// Construct from `VMARK_XDP_OBJECT` / default paths.
    pub fn from_env() -> Result<Self> {
        let object =
            std::env::var(OBJECT_PATH_ENV).unwrap_or_else(|_| DEFAULT_OBJECT_PATH.to_string());
        Self::new(object, DEFAULT_PIN_DIR)
    }

    fn link_path(&self, iface: &str) -> PathBuf {
        self.pin_dir.join(format!("link_{iface}"))
    }

    fn map_path(&self, iface: &str) -> PathBuf {
        self.pin_dir.join(format!("{MAP_NAME}_{iface}"))
    }

    /// Rebuild the ifindex cache from the pin directory. Pins whose
    /// interface no longer exists are left alone (a vanished NIC must
    /// not fail startup) and resolved again when it comes back.
    fn refresh_iface_cache(&mut self) {
        self.ifaces.clear();
        let Ok(entries) = fs::read_dir(&self.pin_dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(iface) = name.to_str().and_then(|n| n.strip_prefix("link_")) else {
                continue;
            };
            match if_nametoindex(iface) {
                Some(ifindex) => {
                    self.ifaces.insert(ifindex, iface.to_string());
                }
                None => {
                    warn!(iface, "pinned link references a missing interface");
                }
            }
        }
    }

    fn iface_name(&mut self, ifindex: u32) -> Result<String> {
        if let Some(name) = self.ifaces.get(&ifindex) {
            return Ok(name.clone());
        }
        self.refresh_iface_cache();
        self.ifaces
            .get(&ifindex)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("no attachment for ifindex {ifindex}")))
    }

    fn open_map(&self, iface: &str) -> Result<BpfHashMap<MapData, FwKey, FwValue>> {
        let path = self.map_path(iface);
        let data = MapData::from_pin(&path).map_err(|e| {
            node_error(
                EbpfError::MapOpen { path: path.clone(), message: e.to_string() },
                "bpf_obj_get",
            )
        })?;
        BpfHashMap::try_from(Map::HashMap(data)).map_err(|e| {
            node_error(EbpfError::MapOp { op: "map_type", message: e.to_string() }, "bpf_obj_get")
        })
    }

    fn load_and_attach(&self, iface: &str) -> std::result::Result<(), EbpfError> {
        let bytes = fs::read(&self.object_path).map_err(|e| EbpfError::ObjectRead {
            path: self.object_path.clone(),
            source: e,
        })?;

        let mut ebpf = EbpfLoader::new()
            .set_max_entries(MAP_NAME, FW_TABLE_CAPACITY)
            .load(&bytes)
            .map_err(EbpfError::Load)?;

        let map_path = self.map_path(iface);
        ebpf.map_mut(MAP_NAME)
            .ok_or(EbpfError::MapNotFound)?
            .pin(&map_path)
            .map_err(|e| EbpfError::Pin { what: "map", path: map_path, message: e.to_string() })?;

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or(EbpfError::ProgramNotFound)?
            .try_into()
            .map_err(EbpfError::ProgramType)?;
        program.load().map_err(EbpfError::ProgramLoad)?;
        let link_id = program.attach(iface, XdpFlags::default()).map_err(EbpfError::Attach)?;

        // Pin the link so the attachment outlives this process; the
        // loaded object can then be dropped.
        let link = program.take_link(link_id).map_err(EbpfError::Attach)?;
        let link_path = self.link_path(iface);
        let fd_link: FdLink = link.try_into().map_err(|e| EbpfError::Pin {
            what: "link",
            path: self.link_path(iface),
            message: format!("{e:?}"),
        })?;
        fd_link.pin(&link_path).map_err(|e| EbpfError::Pin {
            what: "link",
            path: link_path,
            message: e.to_string(),
        })?;
        Ok(())
    }
}

impl Dataplane for XdpDataplane {
    fn resolve_ifindex(&mut self, name: &str) -> Result<u32> {
        if_nametoindex(name).ok_or_else(|| NodeError::NotFound(format!("interface '{name}'")))
    }

    fn attach(&mut self, iface: &str, ifindex: u32) -> Result<()> {
        if self.link_path(iface).exists() {
            // Already attached; promiscuous mode may still need repair
            // after an interface bounce.
            set_promiscuous(iface, true).map_err(|e| node_error(e, "ioctl"))?;
            self.ifaces.insert(ifindex, iface.to_string());
            return Ok(());
        }

        self.load_and_attach(iface).map_err(|e| node_error(e, "bpf_prog_attach"))?;
        set_promiscuous(iface, true).map_err(|e| node_error(e, "ioctl"))?;
        self.ifaces.insert(ifindex, iface.to_string());
        info!(iface, ifindex, "XDP forwarding attached");
        Ok(())
    }

    fn detach(&mut self, ifindex: u32) -> Result<()> {
        let iface = match self.iface_name(ifindex) {
            Ok(name) => name,
            // Nothing attached: idempotent no-op.
            Err(_) => return Ok(()),
        };
        for path in [self.link_path(&iface), self.map_path(&iface)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(convert_io("unlink", &path, e)),
            }
        }
        if let Err(e) = set_promiscuous(&iface, false) {
            // The interface may be gone already; the detach still stands.
            warn!(iface, error = %e, "could not drop promiscuous mode");
        }
        self.ifaces.remove(&ifindex);
        info!(iface, ifindex, "XDP forwarding detached");
        Ok(())
    }

    fn ensure_map(&mut self, ifindex: u32) -> Result<()> {
        let iface = self.iface_name(ifindex)?;
        if !self.map_path(&iface).exists() {
            return Err(NodeError::kernel(
                "bpf_obj_get",
                format!("map {MAP_NAME}_{iface} missing; reattach the interface"),
            ));
        }
        self.open_map(&iface).map(|_| ())
    }

    fn map_put(&mut self, ifindex: u32, key: FwKey, value: FwValue) -> Result<()> {
        let iface = self.iface_name(ifindex)?;
        let mut map = self.open_map(&iface)?;
        map.insert(key, value, 0).map_err(|e| {
            node_error(
                EbpfError::MapOp { op: "update", message: e.to_string() },
                "bpf_map_update_elem",
            )
        })
    }

    fn map_delete(&mut self, ifindex: u32, key: FwKey) -> Result<()> {
        let iface = self.iface_name(ifindex)?;
        let mut map = self.open_map(&iface)?;
        map.remove(&key).map_err(|e| {
            node_error(
                EbpfError::MapOp { op: "delete", message: e.to_string() },
                "bpf_map_delete_elem",
            )
        })
    }

    fn map_clear(&mut self, ifindex: u32) -> Result<()> {
        let iface = self.iface_name(ifindex)?;
        let mut map = self.open_map(&iface)?;
        let keys: Vec<FwKey> = map.keys().collect::<std::result::Result<_, _>>().map_err(|e| {
            node_error(
                EbpfError::MapOp { op: "iterate", message: e.to_string() },
                "bpf_map_get_next_key",
            )
        })?;
        for key in keys {
            map.remove(&key).map_err(|e| {
                node_error(
                    EbpfError::MapOp { op: "delete", message: e.to_string() },
                    "bpf_map_delete_elem",
                )
            })?;
        }
        Ok(())
    }

    fn map_entries(&self, ifindex: u32) -> Result<Vec<(FwKey, FwValue)>> {
        let Some(iface) = self.ifaces.get(&ifindex).cloned() else {
            return Ok(Vec::new());
        };
        let map = self.open_map(&iface)?;
        let mut entries = Vec::new();
        for entry in map.iter() {
            let (key, value) = entry.map_err(|e| {
                node_error(
                    EbpfError::MapOp { op: "iterate", message: e.to_string() },
                    "bpf_map_lookup_elem",
                )
            })?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn attached(&self) -> Result<Vec<u32>> {
        let mut attached = Vec::new();
        let entries = match fs::read_dir(&self.pin_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(attached),
            Err(e) => return Err(convert_io("readdir", &self.pin_dir, e)),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(iface) = name.to_str().and_then(|n| n.strip_prefix("link_")) else {
                continue;
            };
            match if_nametoindex(iface) {
                Some(ifindex) => attached.push(ifindex),
                // A pin for a vanished interface is not an attachment we
                // can (or need to) detach.
                None => debug!(iface, "skipping pinned link for missing interface"),
            }
        }
        Ok(attached)
    }
}

fn if_nametoindex(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;
    #[allow(unsafe_code)]
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    (ifindex != 0).then_some(ifindex)
}

/// Toggle IFF_PROMISC via SIOCGIFFLAGS/SIOCSIFFLAGS on a throwaway
/// datagram socket.
fn set_promiscuous(iface: &str, enable: bool) -> std::result::Result<(), EbpfError> {
    let ioctl_err = |op: &'static str| EbpfError::Ioctl {
        op,
        iface: iface.to_string(),
        source: std::io::Error::last_os_error(),
    };
    if iface.len() >= libc::IFNAMSIZ {
        return Err(EbpfError::InterfaceNotFound(iface.to_string()));
    }

    #[allow(unsafe_code)]
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(ioctl_err("socket"));
        }
        let mut ifr: libc::ifreq = std::mem::zeroed();
        for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) < 0 {
            let err = ioctl_err("SIOCGIFFLAGS");
            libc::close(fd);
            return Err(err);
        }
        let flags = ifr.ifr_ifru.ifru_flags;
        ifr.ifr_ifru.ifru_flags = if enable {
            flags | libc::IFF_PROMISC as libc::c_short
        } else {
            flags & !(libc::IFF_PROMISC as libc::c_short)
        };
        if libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) < 0 {
            let err = ioctl_err("SIOCSIFFLAGS");
            libc::close(fd);
            return Err(err);
        }
        libc::close(fd);
    }
    Ok(())
}

fn convert_io(syscall: &'static str, path: &Path, err: std::io::Error) -> NodeError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        return NodeError::PermissionDenied(format!("{syscall} {}: {err}", path.display()));
    }
    NodeError::kernel(syscall, format!("{}: {err}", path.display()))
}

/// Map an [`EbpfError`] onto the core error model, surfacing privilege
/// problems distinctly from other kernel failures.
fn node_error(err: EbpfError, syscall: &'static str) -> NodeError {
    if is_permission_denied(&err) {
        return NodeError::PermissionDenied(err.to_string());
    }
    NodeError::kernel(syscall, err.to_string())
}

fn is_permission_denied(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return true;
            }
        }
        current = e.source();
    }
    // Pin and map-op variants carry stringified causes.
    err.to_string().contains("Operation not permitted")
        || err.to_string().contains("Permission denied")
}
