use std::collections::VecDeque;
use std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use crate::error::HubError;
use crate::hub::{AddressPair, Hub, HubKind};

/// An in-memory hub: tests push inbound data and inspect what was sent
pub struct MemoryHub {
    kind: HubKind,
    state: Mutex<MemoryHubState>,
}

#[derive(Default)]
struct MemoryHubState {
    inbound: FxHashMap<AddressPair, VecDeque<Result<Bytes, HubError>>>,
    announced: Vec<AddressPair>,
    send_failures: VecDeque<HubError>,
    refused: FxHashSet<AddressPair>,
    connected: Vec<AddressPair>,
    disconnected: Vec<AddressPair>,
    sent: Vec<(AddressPair, Bytes)>,
    closed: bool,
}

impl MemoryHub {
    pub fn new(kind: HubKind) -> MemoryHub {
        MemoryHub {
            kind,
            state: Default::default(),
        }
    }

    pub fn push_inbound(&self, pair: AddressPair, data: &[u8]) {
        self.state.lock().unwrap()
            .inbound.entry(pair)
            .or_default()
            .push_back(Ok(Bytes::copy_from_slice(data)));
    }

    pub fn push_receive_error(&self, pair: AddressPair, error: HubError) {
        self.state.lock().unwrap()
            .inbound.entry(pair)
            .or_default()
            .push_back(Err(error));
    }

    /// the pair is reported by the next call to `incoming`
    pub fn announce(&self, pair: AddressPair) {
        self.state.lock().unwrap().announced.push(pair);
    }

    /// the next sends fail with these errors, in order
    pub fn fail_next_sends(&self, errors: Vec<HubError>) {
        self.state.lock().unwrap().send_failures.extend(errors);
    }

    pub fn refuse_connect(&self, pair: AddressPair) {
        self.state.lock().unwrap().refused.insert(pair);
    }

    pub fn sent(&self) -> Vec<(AddressPair, Bytes)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn connected(&self) -> Vec<AddressPair> {
        self.state.lock().unwrap().connected.clone()
    }

    pub fn disconnected(&self) -> Vec<AddressPair> {
        self.state.lock().unwrap().disconnected.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl Hub for MemoryHub {
    fn kind(&self) -> HubKind {
        self.kind
    }

    async fn connect(&self, pair: AddressPair) -> Result<(), HubError> {
        let mut state = self.state.lock().unwrap();
        if state.refused.contains(&pair) {
            return Err(HubError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.connected.push(pair);
        Ok(())
    }

    async fn incoming(&self) -> Vec<AddressPair> {
        std::mem::take(&mut self.state.lock().unwrap().announced)
    }

    async fn receive(&self, pair: AddressPair) -> Result<Option<Bytes>, HubError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(HubError::Closed);
        }
        match state.inbound.get_mut(&pair).and_then(|q| q.pop_front()) {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn send(&self, pair: AddressPair, data: &[u8]) -> Result<(), HubError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(HubError::Closed);
        }
        if let Some(e) = state.send_failures.pop_front() {
            return Err(e);
        }
        state.sent.push((pair, Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn disconnect(&self, pair: AddressPair) {
        let mut state = self.state.lock().unwrap();
        state.inbound.remove(&pair);
        state.disconnected.push(pair);
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}
