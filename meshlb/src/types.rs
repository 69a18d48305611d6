use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
pub use meshlb_ebpf_common::{BackendId, BackendState, Protocol, Scope, ServiceFlags, ServiceId};

use crate::{Error, Result};

/// Address of a frontend or backend as the datapath sees it. Backends always
/// carry the default (external) scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LbAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scope: Scope,
}

impl LbAddr {
    pub fn new(ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self {
            ip,
            port,
            protocol,
            scope: Scope::External,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl fmt::Display for LbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_host_port(f, &self.ip, self.port)?;
        if self.scope == Scope::Internal {
            f.write_str("/i")?;
        }
        Ok(())
    }
}

pub(crate) fn fmt_host_port(f: &mut fmt::Formatter<'_>, ip: &IpAddr, port: u16) -> fmt::Result {
    match ip {
        IpAddr::V4(v4) => write!(f, "{v4}:{port}"),
        IpAddr::V6(v6) => write!(f, "[{v6}]:{port}"),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    HostPort,
    ExternalIPs,
    LoadBalancer,
    LocalRedirect,
}

impl ServiceType {
    fn flag(&self) -> ServiceFlags {
        match self {
            ServiceType::ClusterIP => ServiceFlags::CLUSTER_IP,
            ServiceType::NodePort => ServiceFlags::NODE_PORT,
            ServiceType::HostPort => ServiceFlags::HOST_PORT,
            ServiceType::ExternalIPs => ServiceFlags::EXTERNAL_IPS,
            ServiceType::LoadBalancer => ServiceFlags::LOAD_BALANCER,
            ServiceType::LocalRedirect => ServiceFlags::LOCAL_REDIRECT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NatPolicy {
    #[default]
    None,
    Nat46,
    Nat64,
}

/// Redirect all service traffic to a node-local L7 proxy listening on
/// `proxy_port`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProxyRedirect {
    pub proxy_port: u16,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-service parameters shared by all frontends of the service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Service {
    pub name: ServiceName,
    pub ext_traffic_policy: TrafficPolicy,
    pub int_traffic_policy: TrafficPolicy,
    pub nat_policy: NatPolicy,
    /// Session affinity with its timeout; `None` disables it.
    pub session_affinity: Option<Duration>,
    pub proxy_redirect: Option<ProxyRedirect>,
    pub source_ranges: Vec<IpNetwork>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frontend {
    pub address: LbAddr,
    pub service_type: ServiceType,
    pub service: Service,
}

impl Frontend {
    /// A zero-address NodePort or HostPort frontend stands in for one
    /// concrete frontend per node address.
    pub fn is_surrogate(&self) -> bool {
        matches!(
            self.service_type,
            ServiceType::NodePort | ServiceType::HostPort
        ) && self.address.ip.is_unspecified()
    }

    pub(crate) fn derived(&self, ip: IpAddr) -> Frontend {
        let mut fe = self.clone();
        fe.address.ip = ip;
        fe
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.address.port == 0 {
            return Err(Error::InvalidFrontend("frontend port must be non-zero".into()));
        }
        if self.address.ip.is_unspecified() && !self.is_surrogate() {
            return Err(Error::InvalidFrontend(format!(
                "unspecified address is only valid for NodePort and HostPort, got {:?}",
                self.service_type
            )));
        }
        if let Some(redirect) = &self.service.proxy_redirect
            && redirect.proxy_port == 0
        {
            return Err(Error::InvalidFrontend("proxy redirect port must be non-zero".into()));
        }
        Ok(())
    }

    /// Flags written to every slot of this frontend's row set.
    pub(crate) fn flags(&self, external_cluster_ip: bool) -> ServiceFlags {
        let svc = &self.service;
        let mut flags = self.service_type.flag();
        if svc.ext_traffic_policy == TrafficPolicy::Local {
            flags |= ServiceFlags::LOCAL;
        }
        if svc.int_traffic_policy == TrafficPolicy::Local {
            flags |= ServiceFlags::INTERNAL_LOCAL;
        }
        if svc.ext_traffic_policy != svc.int_traffic_policy && self.address.scope == Scope::Internal
        {
            flags |= ServiceFlags::TWO_SCOPES;
        }
        if svc.session_affinity.is_some() {
            flags |= ServiceFlags::SESSION_AFFINITY;
        }
        if self.non_routable(external_cluster_ip) {
            flags |= ServiceFlags::NON_ROUTABLE;
        }
        if svc.nat_policy != NatPolicy::None {
            flags |= ServiceFlags::NAT_46X64;
        }
        if svc.proxy_redirect.is_some() {
            flags |= ServiceFlags::L7_LOAD_BALANCER;
        }
        flags
    }

    fn non_routable(&self, external_cluster_ip: bool) -> bool {
        match self.service_type {
            ServiceType::ClusterIP => !external_cluster_ip,
            ServiceType::NodePort | ServiceType::HostPort => self.is_surrogate(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Backend {
    pub addr: LbAddr,
    pub state: BackendState,
    /// Relative share of Maglev buckets; zero means unweighted.
    pub weight: u32,
    pub node_name: Option<String>,
    pub zone: Option<String>,
}

impl Backend {
    pub fn new(addr: LbAddr) -> Self {
        Self {
            addr,
            state: BackendState::Active,
            weight: 0,
            node_name: None,
            zone: None,
        }
    }
}
