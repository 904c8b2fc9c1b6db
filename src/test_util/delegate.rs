use std::sync::{Arc, Mutex};
use bytes::Bytes;
use crate::error::GateError;
use crate::gate::delegate::GateDelegate;
use crate::gate::status::GateStatus;
use crate::hub::AddressPair;
use crate::package::Package;
use crate::ship::DepartureId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Status(AddressPair, GateStatus, GateStatus),
    Received(AddressPair, Bytes),
    /// the error is recorded by its `Display` representation
    Sent(AddressPair, DepartureId, Bytes, Option<String>),
    ProtocolError(AddressPair, String),
}

/// Records all callbacks for later inspection
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<RecordingDelegate> {
        Arc::new(RecordingDelegate::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// the sequence of statuses a pair went through, starting with the first new status
    pub fn statuses(&self, pair: AddressPair) -> Vec<GateStatus> {
        self.events().into_iter()
            .filter_map(|e| match e {
                Event::Status(p, _, new) if p == pair => Some(new),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self, pair: AddressPair) -> Vec<Bytes> {
        self.events().into_iter()
            .filter_map(|e| match e {
                Event::Received(p, body) if p == pair => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self) -> Vec<(DepartureId, Bytes, Option<String>)> {
        self.events().into_iter()
            .filter_map(|e| match e {
                Event::Sent(_, id, body, error) => Some((id, body, error)),
                _ => None,
            })
            .collect()
    }

    pub fn protocol_errors(&self) -> Vec<String> {
        self.events().into_iter()
            .filter_map(|e| match e {
                Event::ProtocolError(_, error) => Some(error),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl<H: Send + Sync + 'static> GateDelegate<H> for RecordingDelegate {
    fn on_status_changed(&self, pair: AddressPair, old: GateStatus, new: GateStatus) {
        self.record(Event::Status(pair, old, new));
    }

    fn on_received(&self, pair: AddressPair, package: Package<H>) {
        self.record(Event::Received(pair, package.body().clone()));
    }

    fn on_sent(&self, pair: AddressPair, id: DepartureId, package: &Package<H>, error: Option<&GateError>) {
        self.record(Event::Sent(pair, id, package.body().clone(), error.map(|e| e.to_string())));
    }

    fn on_protocol_error(&self, pair: AddressPair, error: &GateError) {
        self.record(Event::ProtocolError(pair, error.to_string()));
    }
}
