use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Source of the node addresses that zero-address NodePort/HostPort
/// frontends expand over. The set is read fresh on every reconcile so
/// address churn converges on the next update.
pub trait NodeAddressProvider {
    fn addresses(&self) -> Vec<IpAddr>;
}

/// Address set owned by the embedding agent, replaced wholesale when the
/// node configuration changes.
#[derive(Clone, Debug, Default)]
pub struct StaticNodeAddresses {
    inner: Arc<Mutex<Vec<IpAddr>>>,
}

impl StaticNodeAddresses {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(addrs)),
        }
    }

    pub fn replace(&self, addrs: Vec<IpAddr>) {
        *self.inner.lock().unwrap() = addrs;
    }
}

impl NodeAddressProvider for StaticNodeAddresses {
    fn addresses(&self) -> Vec<IpAddr> {
        self.inner.lock().unwrap().clone()
    }
}
