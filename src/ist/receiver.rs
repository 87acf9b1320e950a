//! Joiner-side incremental stream endpoint.
//!
//! Lifecycle: `prepare` binds an address that goes out inside the state
//! request, `ready` opens the gate once the joiner is positioned,
//! `recv` pulls write-sets until end of range, `finished` tears the
//! endpoint down and reports the last seqno taken. Teardown without
//! `ready` is legal; it covers every failure path of the enclosing
//! request.

use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Receiver;

use crate::core::{SEQNO_UNDEFINED, Seqno, WriteSet};

use super::{IstBus, IstError, IstMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Prepared,
    Ready,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Prepared => "prepared",
            Phase::Ready => "ready",
        }
    }
}

pub struct IstReceiver {
    bus: Arc<IstBus>,
    node: String,
    inner: Mutex<Inner>,
}

struct Inner {
    phase: Phase,
    addr: Option<String>,
    rx: Option<Receiver<IstMessage>>,
    first: Seqno,
    last: Seqno,
    /// Last write-set seqno handed to the caller.
    current: Seqno,
}

impl IstReceiver {
    pub fn new(bus: Arc<IstBus>, node: impl Into<String>) -> Self {
        Self {
            bus,
            node: node.into(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                addr: None,
                rx: None,
                first: SEQNO_UNDEFINED,
                last: SEQNO_UNDEFINED,
                current: SEQNO_UNDEFINED,
            }),
        }
    }

    /// Bind an endpoint for the range `[first, last]` and return its
    /// address for the request descriptor.
    pub fn prepare(&self, first: Seqno, last: Seqno) -> Result<String, IstError> {
        if first > last {
            return Err(IstError::BadRange { first, last });
        }
        let mut inner = self.lock();
        if inner.phase != Phase::Idle {
            return Err(IstError::BadState {
                state: inner.phase.as_str(),
                op: "prepare",
            });
        }
        let (addr, rx) = self.bus.bind(&self.node);
        tracing::info!("ist receiver prepared for [{first}, {last}] at {addr}");
        inner.phase = Phase::Prepared;
        inner.addr = Some(addr.clone());
        inner.rx = Some(rx);
        inner.first = first;
        inner.last = last;
        inner.current = first - 1;
        Ok(addr)
    }

    /// Open the gate: the joiner is positioned and will consume the
    /// stream now.
    pub fn ready(&self) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.phase, Phase::Prepared, "ready without prepare");
        inner.phase = Phase::Ready;
    }

    /// Pull the next write-set; `None` marks end of range.
    pub fn recv(&self) -> Result<Option<WriteSet>, IstError> {
        let rx = {
            let inner = self.lock();
            if inner.phase != Phase::Ready {
                return Err(IstError::BadState {
                    state: inner.phase.as_str(),
                    op: "recv",
                });
            }
            inner.rx.as_ref().expect("ready receiver has channel").clone()
        };
        // The channel is consumed without holding the state lock; there
        // is exactly one consumer, the joiner thread.
        match rx.recv() {
            Ok(IstMessage::WriteSet(ws)) => {
                let mut inner = self.lock();
                inner.current = ws.seqno_g;
                Ok(Some(ws))
            }
            Ok(IstMessage::Eof { last }) => {
                let inner = self.lock();
                if inner.current != last {
                    tracing::warn!(
                        "ist stream ended at {}, sender reported {last}",
                        inner.current
                    );
                }
                Ok(None)
            }
            Err(_) => Err(IstError::StreamClosed),
        }
    }

    /// Tear down the endpoint and report the last seqno taken (`first -
    /// 1` when nothing arrived).
    pub fn finished(&self) -> Seqno {
        let mut inner = self.lock();
        if let Some(addr) = inner.addr.take() {
            self.bus.unbind(&addr);
        }
        tracing::debug!(
            "ist receiver done: prepared [{}, {}], took up to {}",
            inner.first,
            inner.last,
            inner.current
        );
        inner.rx = None;
        inner.phase = Phase::Idle;
        inner.current
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("ist receiver lock")
    }
}
