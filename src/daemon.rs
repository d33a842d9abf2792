//! Daemon setup, relay loop and teardown
//!
//! One task drives every device node: hidraw reads become BLE notifications
//! (through [`Relay`]) and/or writes to the gadget's hidg node, hidg reads go
//! back to the hidraw node. zbus serves attribute protocol calls on the same
//! runtime whenever the loop yields.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{select_all, FutureExt};
use passthru_gatt::{CharacteristicId, NotifyOutcome, SharedTree};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace, warn};

use crate::battery;
use crate::bluez::{self, LeAdvertisement};
use crate::config::PassthruConfig;
use crate::discovery::{validate_name, HidInterface, Sysfs, UsbDevice};
use crate::error::{PassthruError, Result};
use crate::filter::filter_for;
use crate::gadget::{find_udc, Gadget};
use crate::hidraw::{is_transient, HidrawNode, ReportNode, REPORT_SIZE_MAX};
use crate::hogp::{HogpDevice, InterfaceSource, PnpId};
use crate::relay::{FlushReason, Relay, RelayState};
use crate::shutdown::ShutdownContext;

/// Gadget directory name when none is given
pub const DEFAULT_GADGET_NAME: &str = "hid_passthru";

/// Where relayed reports go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outputs {
    pub ble: bool,
    pub usb: bool,
}

/// Everything [`run`] needs, with command-line overrides already applied
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Bus id or `VID:PID`
    pub device: String,
    /// Passthru name used for the gadget directory and the D-Bus root
    pub name: Option<String>,
    pub outputs: Outputs,
    pub config: PassthruConfig,
}

impl DaemonOptions {
    /// D-Bus path of the GATT application
    pub fn object_path(&self) -> String {
        match &self.name {
            Some(name) => format!("/{name}"),
            None => self.config.ble.object_path.clone(),
        }
    }

    pub fn gadget_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_GADGET_NAME)
    }
}

/// BLE side of one relayed interface
struct BleLink {
    tree: SharedTree,
    input_reports: Vec<CharacteristicId>,
    relay: Relay,
}

impl BleLink {
    fn notify_acquired(&self, iface: usize) -> bool {
        self.tree
            .lock()
            .characteristic(self.input_reports[iface])
            .notify_acquired()
    }

    /// Send the pending report of `iface`. A broken notification channel
    /// ends the relay since it can't be acquired again.
    fn flush(&mut self, iface: usize, reason: FlushReason, now: Instant) -> Result<()> {
        let pending = self.relay.pending(iface).to_vec();
        let outcome = self
            .tree
            .lock()
            .notify(self.input_reports[iface], &pending);
        match outcome {
            Ok(NotifyOutcome::Sent) => {
                trace!("Flushed interface {iface} ({reason:?})");
                self.relay.mark_flushed(iface, now);
            }
            // Stays pending, retried on the next tick
            Ok(NotifyOutcome::WouldBlock) | Ok(NotifyOutcome::NotAcquired) => {}
            Err(e) => {
                warn!("Notification channel of interface {iface} failed: {e}");
                return Err(PassthruError::Disconnected);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    /// Source device interface
    Hidraw(usize),
    /// Gadget function of the same interface
    Hidg(usize),
}

struct Relayed {
    hidraw: Vec<Arc<HidrawNode>>,
    hidg: Vec<Arc<HidrawNode>>,
    ble: Option<BleLink>,
}

impl Relayed {
    fn endpoint_node(&self, endpoint: Endpoint) -> &Arc<HidrawNode> {
        match endpoint {
            Endpoint::Hidraw(i) => &self.hidraw[i],
            Endpoint::Hidg(i) => &self.hidg[i],
        }
    }

    /// Route one report read from `endpoint`
    fn dispatch(&mut self, endpoint: Endpoint, report: &[u8], now: Instant) -> Result<()> {
        match endpoint {
            Endpoint::Hidraw(i) => {
                if let Some(hidg) = self.hidg.get(i) {
                    forward(hidg.as_ref(), report)?;
                }
                if let Some(ble) = self.ble.as_mut() {
                    // Nobody is listening yet
                    if !ble.notify_acquired(i) {
                        return Ok(());
                    }
                    if let Some(reason) = ble.relay.on_report(i, report, now) {
                        ble.flush(i, reason, now)?;
                    }
                }
            }
            Endpoint::Hidg(i) => forward(self.hidraw[i].as_ref(), report)?,
        }
        Ok(())
    }
}

/// Write a report in one call; a full queue or a short write drops it,
/// anything else is fatal
fn forward(node: &dyn ReportNode, report: &[u8]) -> Result<()> {
    loop {
        match node.write_report(report) {
            Ok(n) if n < report.len() => {
                trace!("Dropped report, short write of {n}/{} bytes", report.len());
                return Ok(());
            }
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("Dropped report, peer queue full");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(PassthruError::Io(e)),
        }
    }
}

fn set_state(state: &mut RelayState, next: RelayState) {
    if *state != next {
        trace!("Relay {state:?} -> {next:?}");
        *state = next;
    }
}

/// Pump reports until `shutdown` is requested or a node fails
async fn relay_loop(
    relayed: &mut Relayed,
    poll_interval: Duration,
    shutdown: &ShutdownContext,
) -> Result<()> {
    let mut endpoints: Vec<(Endpoint, AsyncFd<Arc<HidrawNode>>)> = Vec::new();
    for i in 0..relayed.hidraw.len() {
        endpoints.push((
            Endpoint::Hidraw(i),
            AsyncFd::new(relayed.hidraw[i].clone())?,
        ));
    }
    for i in 0..relayed.hidg.len() {
        endpoints.push((Endpoint::Hidg(i), AsyncFd::new(relayed.hidg[i].clone())?));
    }

    let mut buf = [0u8; REPORT_SIZE_MAX];
    let mut state = RelayState::DrainingProtocol;

    while !shutdown.is_stopped() {
        set_state(&mut state, RelayState::DrainingProtocol);
        tokio::task::yield_now().await;

        set_state(&mut state, RelayState::PollingHardware);
        let wait = match relayed.ble.as_ref().and_then(|b| b.relay.next_deadline()) {
            Some(deadline) => poll_interval.min(deadline.saturating_duration_since(Instant::now())),
            None => poll_interval,
        };
        let readable = select_all(endpoints.iter().map(|(_, fd)| fd.readable().boxed()));
        tokio::select! {
            _ = shutdown.stopped() => break,
            _ = tokio::time::sleep(wait) => {}
            (ready, _, _) = readable => {
                if let Err(e) = ready {
                    return Err(PassthruError::Io(e));
                }
            }
        }

        for (endpoint, fd) in &endpoints {
            loop {
                let Some(ready) = fd.readable().now_or_never() else {
                    break;
                };
                let mut guard = ready?;
                match guard.try_io(|inner| inner.get_ref().read_report(&mut buf)) {
                    Ok(Ok(0)) => return Err(PassthruError::Disconnected),
                    Ok(Ok(n)) => {
                        relayed.dispatch(*endpoint, &buf[..n], Instant::now())?;
                    }
                    Ok(Err(e)) if is_transient(&e) => continue,
                    Ok(Err(e)) => {
                        warn!(
                            "Read from {} failed: {e}",
                            relayed.endpoint_node(*endpoint).path().display()
                        );
                        return Err(PassthruError::Disconnected);
                    }
                    // Drained, readiness cleared
                    Err(_) => break,
                }
            }
        }

        if let Some(ble) = relayed.ble.as_mut() {
            let now = Instant::now();
            for (iface, reason) in ble.relay.on_tick(now) {
                ble.flush(iface, reason, now)?;
            }
        }
    }

    set_state(&mut state, RelayState::ShuttingDown);
    Ok(())
}

/// Bluetooth resources held for teardown
struct BleSession {
    conn: zbus::Connection,
    device: Arc<HogpDevice>,
    adapter: String,
    app_path: String,
}

impl BleSession {
    async fn start(
        opts: &DaemonOptions,
        dev: &UsbDevice,
        interfaces: &[HidInterface],
        nodes: &[Arc<HidrawNode>],
        shutdown: &ShutdownContext,
    ) -> Result<Self> {
        let conn = zbus::Connection::system().await?;
        let app_path = opts.object_path();
        let ble = &opts.config.ble;

        let sources: Vec<InterfaceSource<'_>> = interfaces
            .iter()
            .zip(nodes)
            .map(|(iface, node)| InterfaceSource {
                usb_index: iface.index,
                report_map: &iface.report_descriptor,
                node: node.clone(),
            })
            .collect();
        let pnp = PnpId {
            vid: dev.vid,
            pid: dev.pid,
            version: dev.bcd_device,
        };
        let device = Arc::new(HogpDevice::new(&app_path, pnp, &sources)?);

        device.publish(&conn).await?;
        bluez::publish_root(
            &conn,
            &app_path,
            LeAdvertisement::new(&ble.local_name, ble.appearance),
        )
        .await?;

        let adapter = match ble.hci {
            Some(hci) => bluez::adapter_path(hci),
            None => bluez::default_adapter(&conn).await,
        };
        info!("Registering {app_path} with {adapter}");
        bluez::register(&conn, &adapter, &app_path, shutdown);

        let battery_conn = conn.clone();
        let battery_name = ble.battery.clone();
        let battery_device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = battery::run(battery_conn, battery_name, battery_device).await {
                warn!("Battery relay unavailable: {e}");
            }
        });

        Ok(Self {
            conn,
            device,
            adapter,
            app_path,
        })
    }

    fn link(&self, config: &PassthruConfig, dev: &UsbDevice) -> Result<BleLink> {
        let interfaces = self.device.interfaces();
        let mut filters = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let filter = filter_for(dev.vid, dev.pid, iface.usb_index);
            if let Some(filter) = filter {
                filter.validate()?;
                debug!("Interface {} uses the report filter", iface.usb_index);
            }
            filters.push(filter);
        }
        Ok(BleLink {
            tree: self.device.tree().clone(),
            input_reports: interfaces.iter().map(|i| i.input_report).collect(),
            relay: Relay::new(config.relay.timing(), filters, Instant::now()),
        })
    }

    async fn stop(self) {
        bluez::unregister(&self.conn, &self.adapter, &self.app_path).await;
        self.device.teardown(&self.conn).await;
        if let Err(e) = bluez::unpublish_root(&self.conn, &self.app_path).await {
            warn!("Failed to unpublish {}: {e}", self.app_path);
        }
    }
}

fn provision_gadget(
    opts: &DaemonOptions,
    sysfs: &Sysfs,
    dev: &UsbDevice,
    interfaces: &[HidInterface],
) -> Result<(Gadget, Vec<Arc<HidrawNode>>)> {
    let config = &opts.config.gadget;
    let mut gadget = Gadget::create(config, opts.gadget_name(), dev, interfaces)?;
    let udc = match &config.udc {
        Some(udc) => udc.clone(),
        None => find_udc(sysfs)?,
    };
    gadget.bind(&udc)?;

    let nodes = interfaces
        .iter()
        .map(|iface| {
            let path = gadget.hidg_node(sysfs, iface.index)?;
            HidrawNode::open(&path).map(Arc::new)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((gadget, nodes))
}

/// Relay `opts.device` until stopped
pub async fn run(opts: DaemonOptions, shutdown: ShutdownContext) -> Result<()> {
    if let Some(name) = &opts.name {
        validate_name(name)?;
    }

    let sysfs = Sysfs::default();
    let dev = sysfs.resolve(&opts.device)?;
    let interfaces = sysfs.hid_interfaces(&dev)?;

    let hidraw = interfaces
        .iter()
        .map(|iface| HidrawNode::open(&iface.hidraw).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // Dropping the gadget on an early return tears it down
    let (gadget, hidg) = if opts.outputs.usb {
        let (gadget, nodes) = provision_gadget(&opts, &sysfs, &dev, &interfaces)?;
        (Some(gadget), nodes)
    } else {
        (None, Vec::new())
    };

    let session = if opts.outputs.ble {
        Some(BleSession::start(&opts, &dev, &interfaces, &hidraw, &shutdown).await?)
    } else {
        None
    };

    let ble = match session.as_ref().map(|s| s.link(&opts.config, &dev)).transpose() {
        Ok(ble) => ble,
        Err(e) => {
            if let Some(session) = session {
                session.stop().await;
            }
            return Err(e);
        }
    };
    let mut relayed = Relayed { hidraw, hidg, ble };

    info!(
        "Relaying {} HID interfaces of {:04x}:{:04x}",
        interfaces.len(),
        dev.vid,
        dev.pid
    );
    let result = relay_loop(&mut relayed, opts.config.relay.poll_interval(), &shutdown).await;
    match &result {
        Ok(()) => info!("Stopping"),
        Err(e) => warn!("Relay stopped: {e}"),
    }

    // Device nodes close before their gadget functions are removed
    drop(relayed);
    if let Some(session) = session {
        session.stop().await;
    }
    if let Some(mut gadget) = gadget {
        gadget.teardown();
    }
    result
}
