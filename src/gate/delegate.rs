use crate::error::GateError;
use crate::gate::status::GateStatus;
use crate::hub::AddressPair;
use crate::package::Package;
use crate::ship::DepartureId;

/// Callbacks from a gate to the application. They are called on the gate's drive loop, so
///  implementations must return promptly - anything slow should be handed off to a different
///  task, since it stalls all I/O of the gate.
///
/// The gate holds on to its delegate until it is terminated. An application that wants to stop
///  receiving callbacks terminates the gate.
pub trait GateDelegate<H>: Send + Sync + 'static {
    fn on_status_changed(&self, pair: AddressPair, old: GateStatus, new: GateStatus);

    fn on_received(&self, pair: AddressPair, package: Package<H>);

    /// Called exactly once for every departure: with `None` after it was sent, or with the
    ///  reason why it was not
    fn on_sent(&self, pair: AddressPair, id: DepartureId, package: &Package<H>, error: Option<&GateError>);

    /// inbound data was dropped because no package could be found in it
    fn on_protocol_error(&self, _pair: AddressPair, _error: &GateError) {}
}
