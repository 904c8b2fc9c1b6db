//! The drive loop is the single task that does all of a gate's work: it polls the hub for
//!  inbound data, frames it in the dockers, hands arrivals to the delegate, and sends due
//!  departures. Everything that touches docker state happens here, and the outside world talks
//!  to the loop through a command channel.
//!
//! Each tick visits all dockers in round-robin order, starting with a different docker every
//!  tick. If a tick did no work, the loop sleeps for the idle interval - that sleep is
//!  interrupted by commands and by termination.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use crate::config::GateConfig;
use crate::docker::{Docker, Outgo, SendOutcome};
use crate::error::{GateError, HubError};
use crate::gate::delegate::GateDelegate;
use crate::gate::status::{ConnectionState, GateStatus};
use crate::hub::{AddressPair, Hub};
use crate::package::Framer;
use crate::seeker::PackageSeeker;
use crate::ship::{priority, Departure, DepartureId};

pub(crate) enum Command<H> {
    Connect(AddressPair),
    Send(Departure<H>),
}

pub(crate) fn next_departure_id(ids: &AtomicU64) -> DepartureId {
    DepartureId::from_raw(ids.fetch_add(1, Ordering::Relaxed))
}

struct Slot<F: Framer> {
    docker: Docker<F>,
    state: ConnectionState,
}

pub(crate) struct DriveLoop<F: Framer> {
    config: Arc<GateConfig>,
    seeker: Arc<PackageSeeker<F>>,
    hub: Arc<dyn Hub>,
    delegate: Arc<dyn GateDelegate<F::Header>>,
    commands: mpsc::UnboundedReceiver<Command<F::Header>>,
    cancel: CancellationToken,
    background: Arc<AtomicBool>,
    statuses: Arc<RwLock<FxHashMap<AddressPair, GateStatus>>>,
    ids: Arc<AtomicU64>,

    slots: FxHashMap<AddressPair, Slot<F>>,
    order: Vec<AddressPair>,
    next_start: usize,
}

impl<F: Framer> DriveLoop<F> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<GateConfig>,
        seeker: Arc<PackageSeeker<F>>,
        hub: Arc<dyn Hub>,
        delegate: Arc<dyn GateDelegate<F::Header>>,
        commands: mpsc::UnboundedReceiver<Command<F::Header>>,
        cancel: CancellationToken,
        background: Arc<AtomicBool>,
        statuses: Arc<RwLock<FxHashMap<AddressPair, GateStatus>>>,
        ids: Arc<AtomicU64>,
    ) -> DriveLoop<F> {
        DriveLoop {
            config,
            seeker,
            hub,
            delegate,
            commands,
            cancel,
            background,
            statuses,
            ids,
            slots: Default::default(),
            order: Vec::new(),
            next_start: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("gate drive loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut busy = self.drain_commands().await;
            busy |= self.register_incoming().await;
            busy |= self.tick().await;
            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            let idle_interval = self.config.idle_interval(self.background.load(Ordering::Acquire));
            let command = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => command,
                _ = sleep(idle_interval) => None,
            };
            if let Some(command) = command {
                self.on_command(command).await;
            }
        }

        self.shutdown().await;
        info!("gate drive loop stopped");
    }

    /// Fails everything that is still queued, closes all connections and releases the hub
    pub(crate) async fn shutdown(mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send(departure) = command {
                self.report_sent(&departure, Some(&GateError::Cancelled));
            }
        }

        for pair in self.order.clone() {
            self.fail_all(pair, || GateError::Cancelled);
            self.set_status(pair, GateStatus::Closed);
        }
        self.hub.close().await;
    }

    async fn drain_commands(&mut self) -> bool {
        let mut busy = false;
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command).await;
            busy = true;
        }
        busy
    }

    async fn on_command(&mut self, command: Command<F::Header>) {
        match command {
            Command::Connect(pair) => {
                self.ensure_docker(pair).await;
            }
            Command::Send(departure) => {
                let status = self.ensure_docker(departure.pair).await;
                if status.is_terminal() {
                    self.report_sent(&departure, Some(&GateError::ConnectionLost { status }));
                }
                else if let Some(slot) = self.slots.get_mut(&departure.pair) {
                    slot.docker.enqueue(departure);
                }
            }
        }
    }

    fn add_slot(&mut self, pair: AddressPair) {
        let docker = Docker::new(pair, self.hub.kind(), self.seeker.clone(), self.config.retry_backoff.clone());
        self.slots.insert(pair, Slot {
            docker,
            state: ConnectionState::new(Instant::now()),
        });
        self.order.push(pair);
        self.statuses.write().unwrap_or_else(|e| e.into_inner())
            .insert(pair, GateStatus::Init);
    }

    fn remove_slot(&mut self, pair: AddressPair) {
        self.slots.remove(&pair);
        self.order.retain(|p| *p != pair);
    }

    /// Returns the pair's status, creating and connecting a docker for it if there is none
    async fn ensure_docker(&mut self, pair: AddressPair) -> GateStatus {
        if let Some(slot) = self.slots.get(&pair) {
            return slot.state.status();
        }

        debug!("new docker for {}", pair);
        self.add_slot(pair);
        self.set_status(pair, GateStatus::Connecting);
        match self.hub.connect(pair).await {
            Ok(()) => {
                self.set_status(pair, GateStatus::Connected);
            }
            Err(e) => {
                warn!("connecting {} failed: {}", pair, e);
                self.set_status(pair, GateStatus::Error);
            }
        }
        self.status(pair)
    }

    async fn register_incoming(&mut self) -> bool {
        let mut busy = false;
        for pair in self.hub.incoming().await {
            match self.slots.get(&pair).map(|slot| slot.state.status()) {
                Some(status) if !status.is_terminal() => continue,
                Some(status) => {
                    debug!("{} is back, replacing its docker in status {:?}", pair, status);
                    self.remove_slot(pair);
                }
                None => debug!("incoming connection {}", pair),
            }
            self.add_slot(pair);
            self.set_status(pair, GateStatus::Connecting);
            self.set_status(pair, GateStatus::Connected);
            busy = true;
        }
        busy
    }

    fn status(&self, pair: AddressPair) -> GateStatus {
        self.slots.get(&pair)
            .map(|slot| slot.state.status())
            .unwrap_or(GateStatus::Init)
    }

    fn set_status(&mut self, pair: AddressPair, next: GateStatus) {
        let Some(slot) = self.slots.get_mut(&pair) else {
            return;
        };
        if let Some((old, new)) = slot.state.transition(next, Instant::now()) {
            self.publish_status(pair, old, new);
        }
    }

    fn publish_status(&self, pair: AddressPair, old: GateStatus, new: GateStatus) {
        debug!("{}: {:?} -> {:?}", pair, old, new);
        self.statuses.write().unwrap_or_else(|e| e.into_inner())
            .insert(pair, new);
        self.delegate.on_status_changed(pair, old, new);
    }

    fn report_sent(&self, departure: &Departure<F::Header>, error: Option<&GateError>) {
        match error {
            None => trace!("{}: departure {} sent", departure.pair, departure.id),
            Some(e) => debug!("{}: departure {} failed: {}", departure.pair, departure.id, e),
        }
        self.delegate.on_sent(departure.pair, departure.id, &departure.package, error);
    }

    fn fail_all(&mut self, pair: AddressPair, error: impl Fn() -> GateError) {
        let departures = match self.slots.get_mut(&pair) {
            Some(slot) => slot.docker.drain(),
            None => return,
        };
        for departure in departures {
            self.report_sent(&departure, Some(&error()));
        }
    }

    /// the connection can not be used any more
    async fn on_connection_lost(&mut self, pair: AddressPair) {
        self.set_status(pair, GateStatus::Error);
        self.fail_all(pair, || GateError::ConnectionLost { status: GateStatus::Error });
        self.hub.disconnect(pair).await;
    }

    fn rotated_order(&mut self) -> Vec<AddressPair> {
        if self.order.is_empty() {
            return Vec::new();
        }
        let start = self.next_start % self.order.len();
        self.next_start = (start + 1) % self.order.len();

        self.order[start..].iter()
            .chain(self.order[..start].iter())
            .copied()
            .collect()
    }

    async fn tick(&mut self) -> bool {
        let mut busy = false;
        for pair in self.rotated_order() {
            busy |= self.service(pair).await;
        }
        busy
    }

    async fn service(&mut self, pair: AddressPair) -> bool {
        let status = self.status(pair);
        if status.is_terminal() {
            return false;
        }

        self.expire_departures(pair);
        if !status.is_ready() {
            return false;
        }

        let mut busy = false;
        for _ in 0..self.config.max_arrivals_per_departure {
            match self.hub.receive(pair).await {
                Ok(Some(data)) => {
                    busy = true;
                    self.on_io(pair);
                    self.on_data(pair, data).await;
                    if self.status(pair).is_terminal() {
                        return true;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if self.on_receive_error(pair, e).await {
                        return true;
                    }
                    break;
                }
            }
        }

        busy |= self.send_next(pair).await;
        self.check_idle(pair);
        busy
    }

    /// returns `true` if the error made the connection unusable
    async fn on_receive_error(&mut self, pair: AddressPair, e: HubError) -> bool {
        if e.is_fatal() {
            warn!("{}: receiving failed: {}", pair, e);
            self.on_connection_lost(pair).await;
            true
        }
        else {
            debug!("{}: receiving failed: {}", pair, e);
            false
        }
    }

    fn on_io(&mut self, pair: AddressPair) {
        let Some(slot) = self.slots.get_mut(&pair) else {
            return;
        };
        if let Some((old, new)) = slot.state.on_io(Instant::now()) {
            self.publish_status(pair, old, new);
        }
    }

    async fn on_data(&mut self, pair: AddressPair, data: Bytes) {
        let Some(slot) = self.slots.get_mut(&pair) else {
            return;
        };

        let feed = slot.docker.feed(&data, Instant::now());
        for reply in feed.replies {
            let departure = Departure::new(next_departure_id(&self.ids), pair, reply, priority::SLOWER, 0, self.config.departure_expiry);
            slot.docker.enqueue(departure);
        }
        for arrival in feed.arrivals {
            trace!("{}: dispatching arrival of {} bytes", pair, arrival.package.len());
            self.delegate.on_received(arrival.pair, arrival.package);
        }

        if let Some(dropped) = feed.desync {
            self.delegate.on_protocol_error(pair, &GateError::Desync { dropped });
            if self.config.error_on_desync {
                self.on_connection_lost(pair).await;
            }
        }
    }

    fn expire_departures(&mut self, pair: AddressPair) {
        let expired = match self.slots.get_mut(&pair) {
            Some(slot) => slot.docker.expire(Instant::now()),
            None => return,
        };
        for departure in expired {
            self.report_sent(&departure, Some(&GateError::Expired));
        }
    }

    async fn send_next(&mut self, pair: AddressPair) -> bool {
        let outgo = match self.slots.get_mut(&pair) {
            Some(slot) => slot.docker.next_due(Instant::now()),
            None => None,
        };

        let departure = match outgo {
            None => return false,
            Some(Outgo::Expired(departure)) => {
                self.report_sent(&departure, Some(&GateError::Expired));
                return true;
            }
            Some(Outgo::Ready(departure)) => departure,
        };

        let result = self.hub.send(pair, departure.package.raw()).await;
        let connection_lost = matches!(&result, Err(e) if e.is_fatal());
        if result.is_ok() {
            self.on_io(pair);
        }

        let outcome = match self.slots.get_mut(&pair) {
            Some(slot) => slot.docker.on_send_result(departure, result, Instant::now()),
            None => return true,
        };
        match outcome {
            SendOutcome::Sent(departure) => self.report_sent(&departure, None),
            SendOutcome::Retrying { id, attempts, due_at } => {
                debug!("{}: departure {} failed {} times, next attempt at {:?}", pair, id, attempts, due_at);
            }
            SendOutcome::Failed(departure, error) => {
                warn!("{}: giving up on departure {}: {}", pair, departure.id, error);
                self.report_sent(&departure, Some(&error));
            }
        }

        if connection_lost {
            self.on_connection_lost(pair).await;
        }
        true
    }

    fn check_idle(&mut self, pair: AddressPair) {
        let now = Instant::now();
        let Some(slot) = self.slots.get_mut(&pair) else {
            return;
        };

        let change = slot.state.check_idle(now, self.config.idle_timeout);
        let heartbeat = match self.config.heartbeat_interval {
            Some(interval) if slot.state.take_heartbeat(now, interval) => self.seeker.framer().heartbeat(),
            _ => None,
        };
        if let Some(package) = heartbeat {
            trace!("{}: sending heartbeat", pair);
            let departure = Departure::new(next_departure_id(&self.ids), pair, package, priority::SLOWER, 0, self.config.departure_expiry);
            slot.docker.enqueue(departure);
        }

        if let Some((old, new)) = change {
            self.publish_status(pair, old, new);
        }
    }
}
