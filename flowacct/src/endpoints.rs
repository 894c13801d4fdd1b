use anyhow::Context as _;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::report::FlowId;

/// What a configured name denotes, judged by its shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// `namespace/name`
    Pod,
    /// `namespace/name/scope`
    Service,
    /// Any other configured name.
    Host,
    /// Not configured; the address itself is used as the name.
    External,
}

impl EndpointKind {
    fn of(name: &str) -> Self {
        match name.split('/').count() {
            2 => EndpointKind::Pod,
            3 => EndpointKind::Service,
            _ => EndpointKind::Host,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Pod => "pod",
            EndpointKind::Service => "service",
            EndpointKind::Host => "host",
            EndpointKind::External => "external",
        }
    }
}

/// Two endpoints by name, in the direction traffic went.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointPair {
    pub from: String,
    pub from_kind: EndpointKind,
    pub to: String,
    pub to_kind: EndpointKind,
}

impl EndpointPair {
    pub fn reversed(&self) -> Self {
        Self {
            from: self.to.clone(),
            from_kind: self.to_kind,
            to: self.from.clone(),
            to_kind: self.from_kind,
        }
    }
}

/// Traffic sent from `pair.from` to `pair.to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointTraffic {
    #[serde(flatten)]
    pub pair: EndpointPair,
    pub bytes: u64,
    pub packets: u64,
}

/// Static address -> name table, e.g. `10.1.0.5: default/web`.
#[derive(Debug, Default, Clone)]
pub struct EndpointDirectory {
    names: HashMap<IpAddr, String>,
}

impl EndpointDirectory {
    pub fn from_config(endpoints: &HashMap<String, String>) -> anyhow::Result<Self> {
        let mut names = HashMap::with_capacity(endpoints.len());
        for (addr, name) in endpoints {
            let ip: IpAddr = addr
                .parse()
                .with_context(|| format!("invalid endpoint address {addr:?}"))?;
            anyhow::ensure!(!name.is_empty(), "endpoint {addr} has an empty name");
            names.insert(ip, name.clone());
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, ip: IpAddr) -> Option<&str> {
        self.names.get(&ip).map(String::as_str)
    }

    /// Named ends of `flow` in key orientation (source to destination), or
    /// `None` when neither end is known.
    pub fn pair(&self, flow: &FlowId) -> Option<EndpointPair> {
        let (src, dst) = (flow.src_ip(), flow.dst_ip());
        let (src_name, dst_name) = (self.name(src), self.name(dst));
        if src_name.is_none() && dst_name.is_none() {
            return None;
        }
        let (from, from_kind) = describe(src, src_name);
        let (to, to_kind) = describe(dst, dst_name);
        Some(EndpointPair {
            from,
            from_kind,
            to,
            to_kind,
        })
    }
}

fn describe(ip: IpAddr, name: Option<&str>) -> (String, EndpointKind) {
    match name {
        Some(name) => (name.to_string(), EndpointKind::of(name)),
        None => (ip.to_string(), EndpointKind::External),
    }
}
