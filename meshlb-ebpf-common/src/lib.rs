#![no_std]

pub mod affinity;
pub mod maglev;
pub mod service;

/// Identifier of a service frontend, shared with the reverse-NAT table.
pub type ServiceId = u16;
/// Identifier of a backend endpoint.
pub type BackendId = u16;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Protocol {
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

/// Lookup scope of a service frontend. Internal entries exist when the
/// external and internal traffic policies differ.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Scope {
    #[default]
    External = 0,
    Internal = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum BackendState {
    #[default]
    Active = 0,
    Terminating = 1,
    Quarantined = 2,
    Maintenance = 3,
}

impl core::fmt::Display for BackendState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            BackendState::Active => "active",
            BackendState::Terminating => "terminating",
            BackendState::Quarantined => "quarantined",
            BackendState::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Flag bits carried in the master slot of a service, consumed by the
/// datapath to select the redirection behavior.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct ServiceFlags(u16);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    pub const CLUSTER_IP: ServiceFlags = ServiceFlags(1 << 0);
    pub const NODE_PORT: ServiceFlags = ServiceFlags(1 << 1);
    pub const HOST_PORT: ServiceFlags = ServiceFlags(1 << 2);
    pub const EXTERNAL_IPS: ServiceFlags = ServiceFlags(1 << 3);
    pub const LOAD_BALANCER: ServiceFlags = ServiceFlags(1 << 4);
    pub const LOCAL_REDIRECT: ServiceFlags = ServiceFlags(1 << 5);
    pub const LOCAL: ServiceFlags = ServiceFlags(1 << 6);
    pub const INTERNAL_LOCAL: ServiceFlags = ServiceFlags(1 << 7);
    pub const SESSION_AFFINITY: ServiceFlags = ServiceFlags(1 << 8);
    pub const NON_ROUTABLE: ServiceFlags = ServiceFlags(1 << 9);
    pub const TWO_SCOPES: ServiceFlags = ServiceFlags(1 << 10);
    pub const NAT_46X64: ServiceFlags = ServiceFlags(1 << 11);
    pub const L7_LOAD_BALANCER: ServiceFlags = ServiceFlags(1 << 12);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        ServiceFlags(bits)
    }

    pub const fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ServiceFlags {
    fn bitor_assign(&mut self, rhs: ServiceFlags) {
        self.0 |= rhs.0;
    }
}

const FLAG_NAMES: &[(ServiceFlags, &str)] = &[
    (ServiceFlags::CLUSTER_IP, "ClusterIP"),
    (ServiceFlags::NODE_PORT, "NodePort"),
    (ServiceFlags::HOST_PORT, "HostPort"),
    (ServiceFlags::EXTERNAL_IPS, "ExternalIPs"),
    (ServiceFlags::LOAD_BALANCER, "LoadBalancer"),
    (ServiceFlags::LOCAL_REDIRECT, "LocalRedirect"),
    (ServiceFlags::LOCAL, "Local"),
    (ServiceFlags::INTERNAL_LOCAL, "InternalLocal"),
    (ServiceFlags::SESSION_AFFINITY, "sessionAffinity"),
    (ServiceFlags::NON_ROUTABLE, "non-routable"),
    (ServiceFlags::TWO_SCOPES, "two-scopes"),
    (ServiceFlags::NAT_46X64, "46x64"),
    (ServiceFlags::L7_LOAD_BALANCER, "l7-load-balancer"),
];

impl core::fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut first = true;
        for (flag, name) in FLAG_NAMES {
            if self.contains(*flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
