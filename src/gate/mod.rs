//! A gate is the application's handle to the transport: it packs payloads into packages, queues
//!  them for sending and reports arrivals and outcomes to its [delegate::GateDelegate].
//!
//! All work happens on a single drive loop task that is started by [Gate::launch]. The gate
//!  itself only sends commands to that loop and reads the status snapshot it publishes, so all
//!  of its methods can be called from any task.

pub mod delegate;
pub mod status;
mod drive_loop;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::config::GateConfig;
use crate::gate::delegate::GateDelegate;
use crate::gate::drive_loop::{next_departure_id, Command, DriveLoop};
use crate::gate::status::GateStatus;
use crate::hub::{AddressPair, Hub};
use crate::package::{Framer, Package};
use crate::seeker::{PackageSeeker, SeekerConfig};
use crate::ship::{Departure, DepartureId};

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// start with the (longer) background idle interval
    pub background: bool,
    /// pairs to connect to right away
    pub connect: Vec<AddressPair>,
}

pub struct Gate<F: Framer> {
    config: Arc<GateConfig>,
    framer: Arc<F>,
    commands: mpsc::UnboundedSender<Command<F::Header>>,
    pending_loop: Option<DriveLoop<F>>,
    drive_loop: Option<JoinHandle<()>>,
    statuses: Arc<RwLock<FxHashMap<AddressPair, GateStatus>>>,
    background: Arc<AtomicBool>,
    ids: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl<F: Framer> Gate<F> {
    /// Creates a gate on top of a hub. The seeker's resync policy is replaced by the one
    ///  configured for the gate, or by the one that fits the hub's kind.
    pub fn new(
        config: GateConfig,
        framer: Arc<F>,
        seeker_config: SeekerConfig,
        hub: Arc<dyn Hub>,
        delegate: Arc<dyn GateDelegate<F::Header>>,
    ) -> anyhow::Result<Gate<F>> {
        config.validate()?;
        let config = Arc::new(config);

        let policy = config.resync_policy.unwrap_or_else(|| hub.kind().resync_policy());
        let seeker = Arc::new(PackageSeeker::new(framer.clone(), seeker_config.with_policy(policy))?);

        let (send, recv) = mpsc::unbounded_channel();
        let statuses: Arc<RwLock<FxHashMap<AddressPair, GateStatus>>> = Default::default();
        let background = Arc::new(AtomicBool::new(false));
        let ids = Arc::new(AtomicU64::new(1));
        let cancel = CancellationToken::new();

        let drive_loop = DriveLoop::new(
            config.clone(),
            seeker,
            hub,
            delegate,
            recv,
            cancel.clone(),
            background.clone(),
            statuses.clone(),
            ids.clone(),
        );

        Ok(Gate {
            config,
            framer,
            commands: send,
            pending_loop: Some(drive_loop),
            drive_loop: None,
            statuses,
            background,
            ids,
            cancel,
        })
    }

    /// Starts the drive loop. Commands that were issued before are processed right away.
    pub fn launch(&mut self, options: LaunchOptions) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            bail!("gate was terminated");
        }
        let drive_loop = self.pending_loop.take()
            .ok_or_else(|| anyhow!("gate was launched already"))?;

        info!("launching gate");
        self.background.store(options.background, Ordering::Release);
        for pair in options.connect {
            self.connect(pair)?;
        }

        self.drive_loop = Some(tokio::spawn(drive_loop.run()));
        Ok(())
    }

    fn command(&self, command: Command<F::Header>) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            bail!("gate was terminated");
        }
        self.commands.send(command)
            .map_err(|_| anyhow!("gate was terminated"))
    }

    /// Creates the docker for a pair (if there is none yet) and connects it. The outcome is
    ///  reported through the delegate's status callback.
    pub fn connect(&self, pair: AddressPair) -> anyhow::Result<()> {
        self.command(Command::Connect(pair))
    }

    /// Packs a payload with the gate's framer and queues it for sending. Lower priority values
    ///  are sent first.
    pub fn send(&self, pair: AddressPair, payload: &[u8], priority: i32, max_retries: u32) -> anyhow::Result<DepartureId> {
        let package = self.framer.pack(payload)?;
        self.send_package(pair, package, priority, max_retries)
    }

    /// Queues a package that was assembled by the caller
    pub fn send_package(&self, pair: AddressPair, package: Package<F::Header>, priority: i32, max_retries: u32) -> anyhow::Result<DepartureId> {
        let id = next_departure_id(&self.ids);
        let departure = Departure::new(id, pair, package, priority, max_retries, self.config.departure_expiry);
        self.command(Command::Send(departure))?;
        Ok(id)
    }

    /// The status of a pair as of the drive loop's most recent change, `None` if the gate has
    ///  no docker for it
    pub fn status(&self, pair: AddressPair) -> Option<GateStatus> {
        self.statuses.read().unwrap_or_else(|e| e.into_inner())
            .get(&pair)
            .copied()
    }

    pub fn enter_background(&self) {
        info!("gate enters background");
        self.background.store(true, Ordering::Release);
    }

    pub fn enter_foreground(&self) {
        info!("gate enters foreground");
        self.background.store(false, Ordering::Release);
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Acquire)
    }

    /// Stops the drive loop, reports all queued departures as cancelled, closes all dockers and
    ///  releases the hub. This waits for the drive loop to finish, but no longer than the
    ///  configured terminate timeout.
    pub async fn terminate(&mut self) {
        info!("terminating gate");
        self.cancel.cancel();

        if let Some(drive_loop) = self.pending_loop.take() {
            drive_loop.shutdown().await;
        }

        if let Some(mut handle) = self.drive_loop.take() {
            match timeout(self.config.terminate_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("gate drive loop failed: {}", e),
                Err(_) => {
                    warn!("gate drive loop did not stop within {:?}, aborting it", self.config.terminate_timeout);
                    handle.abort();
                }
            }
        }
    }
}

impl<F: Framer> Drop for Gate<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
