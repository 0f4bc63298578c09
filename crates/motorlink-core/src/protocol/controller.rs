//! Motor controller driver
//!
//! [`MotorController`] is a cloneable handle to a driver task that owns the
//! transport, the request queue and every timer. Handles talk to the task by
//! message passing; each read comes back on its own oneshot channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::engine::Engine;
use super::monitor::ConnectionMonitor;
use super::queue::Completion;
use super::{
    ConnectionState, Counters, DriverEvent, ProtocolError, RequestError, SerialTransport,
    Transport, TransportEvent,
};
use crate::config::DriverConfig;
use crate::map::{Descriptor, ParamRequest, Reading, Registry};

enum Command {
    Get {
        request: ParamRequest,
        completion: Completion,
    },
    Open {
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    Counters {
        reply: oneshot::Sender<Counters>,
    },
    ResetCounters,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running driver
///
/// Dropping the last handle stops the driver and fails whatever it still had
/// queued with [`RequestError::Stopped`].
#[derive(Clone, Debug)]
pub struct MotorController {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<Registry>,
    status: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<DriverEvent>,
}

impl MotorController {
    /// Start a driver on the given transport
    ///
    /// The port is not opened until [`open`](Self::open) is called. Must be
    /// called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        transport: T,
        registry: impl Into<Arc<Registry>>,
        config: DriverConfig,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let registry = registry.into();
        let heartbeat = registry.lookup(&config.heartbeat)?;

        let monitor = ConnectionMonitor::new(config.event_capacity);
        let events = monitor.event_sender();
        let status = monitor.watch();
        let (commands, rx) = mpsc::unbounded_channel();

        let actor = Actor {
            engine: Engine::new(transport, config.item_timeout(), monitor),
            commands: rx,
            transport_events: None,
            heartbeat,
            ping: None,
            ping_interval: config.ping_interval(),
            reconnect: None,
            reconnect_interval: config.reconnect_interval(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands,
            registry,
            status,
            events,
        })
    }

    /// Start a driver on the serial port named in `config`
    pub fn open_serial(
        config: DriverConfig,
        registry: impl Into<Arc<Registry>>,
    ) -> Result<Self, ProtocolError> {
        config.serial.validate()?;
        let transport = SerialTransport::new(config.serial.clone());
        Self::spawn(transport, registry, config)
    }

    /// Memory map this driver reads from
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Open the port and start the liveness probe
    ///
    /// A failed open is reported here and not retried; automatic reconnects
    /// only follow an unexpected closure of an open port.
    pub async fn open(&self) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open { reply })
            .map_err(|_| ProtocolError::Stopped)?;
        rx.await.map_err(|_| ProtocolError::Stopped)?
    }

    /// Close the port; queued reads fail with [`RequestError::Cancelled`]
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close { reply })
            .map_err(|_| ProtocolError::Stopped)?;
        rx.await.map_err(|_| ProtocolError::Stopped)
    }

    /// Read a parameter or bundle of parameters
    pub async fn get(&self, request: impl Into<ParamRequest>) -> Result<Reading, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Get {
            request: request.into(),
            completion: Completion::Reply(tx),
        })
        .map_err(|_| RequestError::Stopped)?;
        rx.await.map_err(|_| RequestError::Stopped)?
    }

    /// Read a parameter or group by its dotted path
    pub async fn get_named(&self, path: &str) -> Result<Reading, RequestError> {
        let request = self.registry.resolve(path)?;
        self.get(request).await
    }

    /// Read a descriptor directly
    pub async fn get_descriptor(&self, descriptor: &Arc<Descriptor>) -> Result<Reading, RequestError> {
        self.get(ParamRequest::Single(Arc::clone(descriptor))).await
    }

    /// Queue a read and hand the outcome to `callback` on the driver task
    ///
    /// The callback runs exactly once. It must not block.
    pub fn get_with<F>(&self, request: impl Into<ParamRequest>, callback: F)
    where
        F: FnOnce(Result<Reading, RequestError>) + Send + 'static,
    {
        let command = Command::Get {
            request: request.into(),
            completion: Completion::Callback(Box::new(callback)),
        };
        if let Err(mpsc::error::SendError(Command::Get { completion, .. })) = self.send(command) {
            completion.complete(Err(RequestError::Stopped));
        }
    }

    /// Fail every queued read that is not yet in flight; returns how many
    pub async fn cancel_all(&self) -> Result<usize, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelAll { reply })
            .map_err(|_| ProtocolError::Stopped)?;
        rx.await.map_err(|_| ProtocolError::Stopped)
    }

    /// Current link status
    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Receiver that is updated on every status change
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Subscribe to lifecycle and traffic events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub async fn counters(&self) -> Result<Counters, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Counters { reply })
            .map_err(|_| ProtocolError::Stopped)?;
        rx.await.map_err(|_| ProtocolError::Stopped)
    }

    pub fn reset_counters(&self) -> Result<(), ProtocolError> {
        self.send(Command::ResetCounters)
            .map_err(|_| ProtocolError::Stopped)
    }

    /// Stop the driver and wait for it to release the port
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), mpsc::error::SendError<Command>> {
        self.commands.send(command)
    }
}

struct Actor<T: Transport> {
    engine: Engine<T>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Events of the current transport session
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    heartbeat: Arc<Descriptor>,
    ping: Option<Interval>,
    ping_interval: Duration,
    reconnect: Option<Interval>,
    reconnect_interval: Duration,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self) {
        let mut stopped_by = None;
        loop {
            let deadline = self.engine.deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command) {
                            stopped_by = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
                event = next_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event),
                    None => self.transport_events = None,
                },
                _ = sleep_until_deadline(deadline) => self.engine.on_timeout(),
                _ = tick(&mut self.ping) => self.engine.ping(&self.heartbeat),
                _ = tick(&mut self.reconnect) => self.try_reopen(),
            }
        }

        self.engine.shutdown();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Get { completion, .. } = command {
                completion.complete(Err(RequestError::Stopped));
            }
        }
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
    }

    /// Apply a command; returns the reply channel if it asked to stop
    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Get {
                request,
                completion,
            } => self.engine.enqueue(request, completion),
            Command::Open { reply } => {
                let _ = reply.send(self.open());
            }
            Command::Close { reply } => {
                self.engine.close();
                self.transport_events = None;
                self.reconnect = None;
                self.ping = None;
                let _ = reply.send(());
            }
            Command::CancelAll { reply } => {
                let _ = reply.send(self.engine.cancel_all());
            }
            Command::Counters { reply } => {
                let _ = reply.send(self.engine.counters());
            }
            Command::ResetCounters => self.engine.reset_counters(),
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn open(&mut self) -> Result<(), ProtocolError> {
        if self.engine.state().is_open() {
            return Ok(());
        }
        self.start_session()?;
        self.reconnect = None;
        if self.ping.is_none() {
            // First probe fires immediately
            let mut ping = interval(self.ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ping = Some(ping);
        }
        Ok(())
    }

    /// Open the transport with a fresh event channel
    fn start_session(&mut self) -> Result<(), ProtocolError> {
        if self.engine.state().is_open() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.open(tx)?;
        self.transport_events = Some(rx);
        Ok(())
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => self.engine.on_data(bytes),
            TransportEvent::Error(message) => self.engine.on_transport_error(message),
            TransportEvent::Closed => {
                self.transport_events = None;
                if self.engine.on_closed() {
                    info!(
                        pending = self.engine.pending(),
                        "retrying every {} ms",
                        self.reconnect_interval.as_millis()
                    );
                    let mut reconnect = interval_at(
                        Instant::now() + self.reconnect_interval,
                        self.reconnect_interval,
                    );
                    reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.reconnect = Some(reconnect);
                }
            }
        }
    }

    fn try_reopen(&mut self) {
        self.engine.monitor().reopening();
        match self.start_session() {
            Ok(()) => {
                info!("port reopened");
                self.reconnect = None;
            }
            Err(e) => debug!("reopen failed: {}", e),
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) -> Instant {
    match timer {
        Some(timer) => timer.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{DemoController, DemoMode};
    use crate::map::default_map;

    fn config() -> DriverConfig {
        DriverConfig::for_port("demo")
    }

    #[tokio::test]
    async fn test_unknown_heartbeat_is_rejected() {
        let mut config = config();
        config.heartbeat = "status.nope".into();
        let result = MotorController::spawn(DemoController::new(), default_map().unwrap(), config);
        assert!(matches!(result, Err(ProtocolError::Registry(_))));
    }

    #[tokio::test]
    async fn test_get_before_open_waits_for_open() {
        let demo = DemoController::new();
        let controller = MotorController::spawn(demo, default_map().unwrap(), config()).unwrap();
        assert_eq!(controller.status(), ConnectionState::Closed);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.get_named("meters.runtime_hours").await })
        };
        tokio::task::yield_now().await;
        controller.open().await.unwrap();

        let reading = pending.await.unwrap().unwrap();
        assert_eq!(reading.value().and_then(|v| v.as_number()), Some(300.0));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_with_callback() {
        let controller =
            MotorController::spawn(DemoController::new(), default_map().unwrap(), config()).unwrap();
        controller.open().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let pwm = controller.registry().lookup("status.pwm").unwrap();
        controller.get_with(pwm, move |result| {
            let _ = tx.send(result);
        });
        let reading = rx.await.unwrap().unwrap();
        assert!(reading.value().is_some());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_report_stopped() {
        let controller = MotorController::spawn(
            DemoController::with_mode(DemoMode::Silent),
            default_map().unwrap(),
            config(),
        )
        .unwrap();
        controller.shutdown().await;

        assert_eq!(
            controller.get_named("status.pwm").await,
            Err(RequestError::Stopped)
        );
        assert!(matches!(controller.open().await, Err(ProtocolError::Stopped)));
        assert!(controller.counters().await.is_err());

        let (tx, rx) = oneshot::channel();
        controller.get_with(ParamRequest::Bundle(Vec::new()), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Err(RequestError::Stopped));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let controller =
            MotorController::spawn(DemoController::new(), default_map().unwrap(), config()).unwrap();
        assert_eq!(
            controller.get_named("status.rpm").await,
            Err(RequestError::UnknownParameter("status.rpm".into()))
        );
    }
}
