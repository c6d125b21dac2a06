use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// A service definition, as published by the registry.
///
/// Every update carries a complete snapshot; a service is never described as a diff against a
/// prior definition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,

    /// The address on which clients reach the service.
    #[serde(default)]
    pub address: Option<IpAddr>,

    /// The port on which clients reach the service. Zero means unset.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// The backends currently registered for the service. Order is irrelevant.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// A backend endpoint of a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub name: String,

    /// The instance group the instance was registered under. Groups don't affect forwarding.
    #[serde(default = "default_group")]
    pub group: String,

    pub address: IpAddr,
    pub port: u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A change to a single service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServiceUpdate {
    /// Replaces the desired state of the named service.
    Apply(Service),

    /// Removes the named service.
    Delete { name: String },
}

fn default_group() -> String {
    crate::DEFAULT_GROUP.to_string()
}

// === impl Service ===

impl Service {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Indicates whether traffic for this service should be handled at all, i.e. whether the
    /// service has both an address and a port.
    ///
    /// This only depends on the service's own address and port, never on its instances.
    pub fn should_forward(&self) -> bool {
        self.address.is_some() && self.port > 0
    }

    /// The address and port clients use to reach the service, if it is forward-eligible.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.port == 0 {
            return None;
        }
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// A short summary of the service suitable for log lines.
impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(
                f,
                "{} ({} {}, {} instances)",
                self.name,
                self.protocol,
                addr,
                self.instances.len()
            ),
            None => write!(f, "{} (no address, {} instances)", self.name, self.instances.len()),
        }
    }
}

// === impl Instance ===

impl Instance {
    pub fn new(name: impl ToString, addr: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            group: default_group(),
            address: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ServiceUpdate ===

impl ServiceUpdate {
    pub fn name(&self) -> &str {
        match self {
            Self::Apply(svc) => &svc.name,
            Self::Delete { name } => name,
        }
    }

    pub fn delete(name: impl ToString) -> Self {
        Self::Delete {
            name: name.to_string(),
        }
    }
}
