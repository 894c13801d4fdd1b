use anyhow::Context as _;
use aya::maps::{HashMap as AyaHashMap, Map, MapData};
use aya::programs::{CgroupAttachMode, CgroupSkb, CgroupSkbAttachType};
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use std::fs::File;
use std::path::Path;

use flowacct_common::{FlowKeyV4, FlowKeyV6, FlowStats, V4_FLOWS_MAP, V6_FLOWS_MAP};

use crate::config::Config;
use crate::report::{FlowId, FlowSource};

pub const INGRESS_PROGRAM: &str = "flowacct_ingress";
pub const EGRESS_PROGRAM: &str = "flowacct_egress";

/// Load the eBPF object with the configured map sizes.
pub fn load(config: &Config) -> anyhow::Result<Ebpf> {
    let bpf = EbpfLoader::new()
        .set_max_entries(V4_FLOWS_MAP, config.v4_capacity)
        .set_max_entries(V6_FLOWS_MAP, config.v6_capacity)
        .load(aya::include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../flowacct-ebpf/target/bpfel-unknown-none/debug/flowacct"
        )))
        .context("failed to load eBPF object")?;
    tracing::info!(
        "flow maps sized: {} IPv4 / {} IPv6 entries",
        config.v4_capacity,
        config.v6_capacity
    );
    Ok(bpf)
}

/// Forward kernel-side log records into the agent's log. aya-log spawns
/// its own per-CPU readers.
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        tracing::warn!("failed to initialize eBPF logger: {e}");
    }
}

/// Attach the ingress and egress programs to `cgroup_path`.
pub fn attach(bpf: &mut Ebpf, cgroup_path: &Path) -> anyhow::Result<()> {
    let cgroup = File::open(cgroup_path)
        .with_context(|| format!("failed to open cgroup {}", cgroup_path.display()))?;

    for (name, attach_type, label) in [
        (INGRESS_PROGRAM, CgroupSkbAttachType::Ingress, "ingress"),
        (EGRESS_PROGRAM, CgroupSkbAttachType::Egress, "egress"),
    ] {
        let program: &mut CgroupSkb = bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()?;
        program.load()?;
        program.attach(&cgroup, attach_type, CgroupAttachMode::Single)?;
        tracing::info!("{} attached to {} ({})", name, cgroup_path.display(), label);
    }
    Ok(())
}

/// The two kernel flow tables, opened for enumeration.
pub struct KernelMaps {
    v4: AyaHashMap<MapData, FlowKeyV4, FlowStats>,
    v6: AyaHashMap<MapData, FlowKeyV6, FlowStats>,
}

impl KernelMaps {
    /// Take the maps out of a loaded object, pinning them first if asked.
    pub fn take(bpf: &mut Ebpf, pin_dir: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(dir) = pin_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create pin directory {}", dir.display()))?;
        }
        Ok(Self {
            v4: take_flow_map(bpf, V4_FLOWS_MAP, pin_dir)?,
            v6: take_flow_map(bpf, V6_FLOWS_MAP, pin_dir)?,
        })
    }

    /// Open maps pinned by a running agent.
    pub fn from_pins(dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            v4: open_pinned(&dir.join(V4_FLOWS_MAP))?,
            v6: open_pinned(&dir.join(V6_FLOWS_MAP))?,
        })
    }
}

impl FlowSource for KernelMaps {
    fn snapshot(&self) -> anyhow::Result<Vec<(FlowId, FlowStats)>> {
        let mut flows = Vec::new();
        for entry in self.v4.iter() {
            let (key, stats) = entry.context("failed to read V4_FLOWS")?;
            flows.push((FlowId::V4(key), stats));
        }
        for entry in self.v6.iter() {
            let (key, stats) = entry.context("failed to read V6_FLOWS")?;
            flows.push((FlowId::V6(key), stats));
        }
        Ok(flows)
    }
}

fn take_flow_map<K: Pod, V: Pod>(
    bpf: &mut Ebpf,
    name: &str,
    pin_dir: Option<&Path>,
) -> anyhow::Result<AyaHashMap<MapData, K, V>> {
    let map = bpf
        .take_map(name)
        .with_context(|| format!("map {name} not found"))?;
    let map = match (map, pin_dir) {
        (Map::HashMap(data), Some(dir)) => {
            let path = dir.join(name);
            data.pin(&path)
                .with_context(|| format!("failed to pin {name} at {}", path.display()))?;
            tracing::info!("{} pinned at {}", name, path.display());
            Map::HashMap(data)
        }
        (map, _) => map,
    };
    Ok(AyaHashMap::try_from(map)?)
}

fn open_pinned<K: Pod, V: Pod>(path: &Path) -> anyhow::Result<AyaHashMap<MapData, K, V>> {
    let data = MapData::from_pin(path)
        .with_context(|| format!("failed to open pinned map {}", path.display()))?;
    Ok(AyaHashMap::try_from(Map::HashMap(data))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pins_reports_missing_map() {
        let dir = std::env::temp_dir().join("flowacct-no-such-pin-dir");
        let err = match KernelMaps::from_pins(&dir) {
            Ok(_) => panic!("opened maps from a directory that does not exist"),
            Err(e) => format!("{e:#}"),
        };
        assert!(err.contains("failed to open pinned map"));
        assert!(err.contains("V4_FLOWS"));
    }
}
