//! Addressable endpoint registry for incremental-transfer streams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};

use super::{IstError, IstMessage};

/// Routes sender connections to bound receiver endpoints by address.
/// All nodes that may exchange incremental streams share one bus.
pub struct IstBus {
    scope: String,
    endpoints: Mutex<HashMap<String, Sender<IstMessage>>>,
    next_id: AtomicU64,
}

impl IstBus {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            endpoints: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind a fresh endpoint, returning its address and receive side.
    pub fn bind(&self, node: &str) -> (String, Receiver<IstMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let addr = format!("ist://{}/{node}/{id}", self.scope);
        let (tx, rx) = unbounded();
        self.endpoints
            .lock()
            .expect("ist bus lock")
            .insert(addr.clone(), tx);
        (addr, rx)
    }

    pub fn connect(&self, addr: &str) -> Result<Sender<IstMessage>, IstError> {
        self.endpoints
            .lock()
            .expect("ist bus lock")
            .get(addr)
            .cloned()
            .ok_or_else(|| IstError::PeerNotFound {
                addr: addr.to_string(),
            })
    }

    pub fn unbind(&self, addr: &str) {
        self.endpoints.lock().expect("ist bus lock").remove(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::core::WriteSet;

    #[test]
    fn bind_connect_unbind() {
        let bus = IstBus::new("test");
        let (addr, rx) = bus.bind("node-a");
        assert!(addr.starts_with("ist://test/node-a/"));

        let tx = bus.connect(&addr).unwrap();
        tx.send(IstMessage::WriteSet(WriteSet::new(1, 1, 0, Bytes::new())))
            .unwrap();
        assert!(matches!(rx.recv().unwrap(), IstMessage::WriteSet(_)));

        bus.unbind(&addr);
        let err = bus.connect(&addr).unwrap_err();
        assert!(matches!(err, IstError::PeerNotFound { .. }));
    }

    #[test]
    fn addresses_are_unique() {
        let bus = IstBus::new("test");
        let (a, _rx_a) = bus.bind("node");
        let (b, _rx_b) = bus.bind("node");
        assert_ne!(a, b);
    }
}
