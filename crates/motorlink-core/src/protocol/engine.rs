//! Request queue engine
//!
//! Drives the transport one frame at a time. A frame is in flight from the
//! moment it is written until its response arrives or its deadline passes;
//! nothing else is written in between.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::codec::{self, Response};
use super::monitor::{ConnectionMonitor, ConnectionState, DriverEvent};
use super::queue::{Completion, Request, RequestQueue};
use super::{Counters, EventSender, ProtocolError, RequestError, Transport};
use crate::map::{Descriptor, ParamRequest};

pub(crate) struct Engine<T: Transport> {
    transport: T,
    queue: RequestQueue,
    /// Deadline of the frame in flight
    awaiting: Option<Instant>,
    item_timeout: Duration,
    monitor: ConnectionMonitor,
    counters: Counters,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, item_timeout: Duration, monitor: ConnectionMonitor) -> Self {
        Self {
            transport,
            queue: RequestQueue::default(),
            awaiting: None,
            item_timeout,
            monitor,
            counters: Counters::default(),
        }
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    /// Deadline of the frame in flight, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.awaiting
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue a read and start it if the link is idle
    pub fn enqueue(&mut self, shape: ParamRequest, completion: Completion) {
        let request = Request::new(shape, completion);
        if request.is_empty() {
            debug!("rejecting request with nothing to read");
            request.fail(RequestError::EmptyRequest);
            return;
        }
        debug!(request = %request.label(), queued = self.queue.len(), "request queued");
        self.queue.push(request);
        self.pump();
    }

    /// Transmit the head's current item unless something is already in flight
    fn pump(&mut self) {
        while self.awaiting.is_none() && self.monitor.state().is_open() {
            let Some(head) = self.queue.head() else {
                return;
            };
            let Some(frame) = head.current_frame() else {
                // Fully read heads are popped as soon as their last byte lands
                if let Some(done) = self.queue.pop() {
                    done.finish();
                }
                continue;
            };

            self.monitor.emit(DriverEvent::Sending(frame));
            self.counters.sent += 1;
            self.awaiting = Some(Instant::now() + self.item_timeout);
            debug!(frame = %frame, "sending");

            self.transport.discard_input();
            if let Err(e) = self.transport.write(&frame) {
                warn!(frame = %frame, "write failed: {}", e);
                self.awaiting = None;
                self.fail_head(RequestError::TransportClosed);
            }
        }
    }

    fn fail_head(&mut self, err: RequestError) {
        if let Some(request) = self.queue.pop() {
            debug!(request = %request.label(), "request failed: {}", err);
            request.fail(err);
        }
    }

    /// Handle one response frame from the transport
    pub fn on_data(&mut self, bytes: Vec<u8>) {
        if self.awaiting.is_none() {
            debug!(bytes = ?bytes, "dropping bytes received with nothing in flight");
            return;
        }
        self.awaiting = None;
        self.counters.received += 1;
        let response = codec::classify(&bytes);
        self.monitor.emit(DriverEvent::Receiving(bytes));

        match response {
            Response::Data(byte) => {
                self.monitor.device_answered();
                let done = match self.queue.head_mut() {
                    Some(head) => head.accept(byte),
                    None => false,
                };
                if done {
                    if let Some(request) = self.queue.pop() {
                        debug!(request = %request.label(), "request complete");
                        request.finish();
                    }
                }
            }
            Response::NoClock => {
                self.counters.no_clock += 1;
                warn!("controller reports no clock");
                self.fail_head(RequestError::NoClock);
                self.monitor.device_lost();
            }
            Response::Unrecognized | Response::Malformed => {
                self.counters.invalid += 1;
                warn!(response = ?response, "invalid response");
                self.fail_head(RequestError::InvalidResponse);
            }
        }
        self.pump();
    }

    /// The in-flight frame's deadline passed
    pub fn on_timeout(&mut self) {
        if self.awaiting.take().is_none() {
            return;
        }
        self.counters.timeouts += 1;
        warn!("message timeout");
        self.transport.discard_input();
        self.monitor.device_lost();
        self.fail_head(RequestError::Timeout);
        self.pump();
    }

    /// Fail every request that is not in flight; returns how many
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.queue.take_waiting(self.awaiting.is_some());
        let count = cancelled.len();
        for request in cancelled {
            request.fail(RequestError::Cancelled);
        }
        if count > 0 {
            info!(count, "cancelled queued requests");
        }
        count
    }

    /// Open the transport; queued requests start on success
    pub fn open(&mut self, events: EventSender) -> Result<(), ProtocolError> {
        if self.monitor.state().is_open() {
            return Ok(());
        }
        self.monitor.opening();
        match self.transport.open(events) {
            Ok(()) => {
                info!(port = %self.transport.describe(), "opened");
                self.monitor.opened();
                self.pump();
                Ok(())
            }
            Err(e) => {
                self.monitor.open_failed();
                debug!(port = %self.transport.describe(), "open failed: {}", e);
                Err(e)
            }
        }
    }

    /// The transport closed on its own; returns true if it had been open
    ///
    /// Queued requests are kept for the next session. A frame already in
    /// flight still resolves through its deadline.
    pub fn on_closed(&mut self) -> bool {
        if !self.monitor.state().is_open() {
            return false;
        }
        self.transport.close();
        self.counters.port_closed += 1;
        warn!(port = %self.transport.describe(), pending = self.queue.len(), "port closed unexpectedly");
        self.monitor.closed()
    }

    pub fn on_transport_error(&mut self, message: String) {
        self.counters.port_errors += 1;
        self.monitor.transport_error(message);
    }

    /// Read the heartbeat parameter if the link is idle
    pub fn ping(&mut self, heartbeat: &Arc<Descriptor>) {
        if self.monitor.state().is_open() && self.queue.is_empty() {
            self.enqueue(ParamRequest::Single(Arc::clone(heartbeat)), Completion::Discard);
        }
    }

    /// Close the port on request; every queued request is cancelled
    pub fn close(&mut self) {
        self.awaiting = None;
        for request in self.queue.take_all() {
            request.fail(RequestError::Cancelled);
        }
        self.transport.close();
        self.monitor.closed();
    }

    /// Fail everything and release the transport
    pub fn shutdown(&mut self) {
        self.awaiting = None;
        for request in self.queue.take_all() {
            request.fail(RequestError::Stopped);
        }
        self.transport.close();
        self.monitor.closed();
        info!("driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{DemoController, DemoHandle, DemoMode};
    use crate::map::{Reading, Registry, Scale, Value};
    use crate::protocol::TransportEvent;
    use pretty_assertions::assert_eq;
    use tokio::sync::{broadcast, mpsc, oneshot};

    type Reply = oneshot::Receiver<Result<Reading, RequestError>>;

    struct Harness {
        engine: Engine<DemoController>,
        demo: DemoHandle,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        events: broadcast::Receiver<DriverEvent>,
        registry: Registry,
    }

    impl Harness {
        fn new() -> Self {
            let demo = DemoController::with_mode(DemoMode::Manual);
            let handle = demo.handle();
            let monitor = ConnectionMonitor::new(64);
            let events = monitor.subscribe();
            let mut engine = Engine::new(demo, Duration::from_millis(1000), monitor);
            let (tx, transport_rx) = mpsc::unbounded_channel();
            engine.open(tx).unwrap();
            let registry = Registry::builder()
                .param(
                    "meters.hours",
                    Descriptor::eeprom("Hours", vec![0x62, 0x63]).scale(Scale::Word),
                )
                .param(
                    "config.max_speed",
                    Descriptor::eeprom("Max Speed", vec![0x10])
                        .bounds(0x20, 0xFE)
                        .scale(Scale::Percent),
                )
                .param("status.pwm", Descriptor::ram_high("PWM", vec![0x120]))
                .build()
                .unwrap();
            Self {
                engine,
                demo: handle,
                transport_rx,
                events,
                registry,
            }
        }

        fn get(&mut self, path: &str) -> Reply {
            let (tx, rx) = oneshot::channel();
            let shape = self.registry.resolve(path).unwrap();
            self.engine.enqueue(shape, Completion::Reply(tx));
            rx
        }

        /// Answer the frame in flight
        fn reply(&mut self, bytes: &[u8]) {
            assert!(self.demo.inject(bytes));
            self.deliver();
        }

        fn deliver(&mut self) {
            while let Ok(event) = self.transport_rx.try_recv() {
                match event {
                    TransportEvent::Data(bytes) => self.engine.on_data(bytes),
                    TransportEvent::Error(msg) => self.engine.on_transport_error(msg),
                    TransportEvent::Closed => {
                        self.engine.on_closed();
                    }
                }
            }
        }

        fn events(&mut self) -> Vec<DriverEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn written(&self) -> Vec<[u8; 3]> {
            self.demo.written_bytes()
        }
    }

    #[test]
    fn test_multi_address_item_sends_each_frame_in_order() {
        let mut h = Harness::new();
        let mut rx = h.get("meters.hours");
        assert_eq!(h.written(), vec![[0x07, 0x62, 0x00]]);

        h.reply(&[0x01, 0, 0]);
        assert_eq!(h.written(), vec![[0x07, 0x62, 0x00], [0x07, 0x63, 0x00]]);
        assert!(rx.try_recv().is_err());

        h.reply(&[0x2C, 0, 0]);
        let reading = rx.try_recv().unwrap().unwrap();
        assert_eq!(reading, Reading::Value(Value::Number(300)));
        assert_eq!(h.engine.counters().sent, 2);
        assert_eq!(h.engine.counters().received, 2);
        assert_eq!(h.engine.deadline(), None);
    }

    #[test]
    fn test_single_flight() {
        let mut h = Harness::new();
        let _a = h.get("status.pwm");
        let _b = h.get("config.max_speed");
        let _c = h.get("meters.hours");
        // only the first frame goes out until it is answered
        assert_eq!(h.written().len(), 1);
        assert!(h.engine.deadline().is_some());
        assert_eq!(h.engine.pending(), 3);
    }

    #[test]
    fn test_percent_scenario() {
        let mut h = Harness::new();
        let mut rx = h.get("config.max_speed");
        assert_eq!(h.written(), vec![[0x07, 0x10, 0x00]]);
        h.reply(&[0x60, 0, 0]);
        assert_eq!(rx.try_recv().unwrap(), Ok(Reading::Value(Value::Percent(25))));
    }

    #[test]
    fn test_connected_on_first_answer() {
        let mut h = Harness::new();
        assert_eq!(h.events(), vec![DriverEvent::Open]);
        let _rx = h.get("status.pwm");
        h.reply(&[0x80, 0, 0]);
        assert_eq!(
            h.events(),
            vec![
                DriverEvent::Sending(crate::protocol::Frame::from_bytes([0x21, 0x20, 0x00])),
                DriverEvent::Receiving(vec![0x80, 0, 0]),
                DriverEvent::Connected,
            ]
        );
        assert!(h.engine.state().is_connected());
    }

    #[test]
    fn test_no_clock_fails_and_disconnects() {
        let mut h = Harness::new();
        let _warmup = h.get("status.pwm");
        h.reply(&[0x80, 0, 0]);
        h.events();

        let mut rx = h.get("status.pwm");
        h.reply(&[0x77, 0x77, 0x77]);
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::NoClock));
        assert_eq!(h.engine.counters().no_clock, 1);
        assert!(!h.engine.state().is_connected());
        assert!(h.events().contains(&DriverEvent::Disconnected));
        assert_eq!(h.registry.lookup("status.pwm").unwrap().last_value(), Some(vec![0x80]));
    }

    #[test]
    fn test_invalid_response_moves_to_next_request_immediately() {
        let mut h = Harness::new();
        let mut first = h.get("status.pwm");
        let mut second = h.get("meters.hours");

        h.reply(&[0x07, 0x07, 0x07]);
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::InvalidResponse));
        assert_eq!(h.written(), vec![[0x21, 0x20, 0x00], [0x07, 0x62, 0x00]]);

        h.reply(&[0x01, 0x02]);
        assert_eq!(second.try_recv().unwrap(), Err(RequestError::InvalidResponse));
        assert_eq!(h.engine.counters().invalid, 2);
        assert!(!h.engine.state().is_connected());
    }

    #[test]
    fn test_unsolicited_bytes_are_dropped() {
        let mut h = Harness::new();
        h.reply(&[0x42, 0, 0]);
        assert_eq!(h.engine.counters(), Counters::default());
        assert!(!h.engine.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_head_and_continues() {
        let mut h = Harness::new();
        let _warmup = h.get("status.pwm");
        h.reply(&[0x80, 0, 0]);
        h.events();

        let mut first = h.get("status.pwm");
        let mut second = h.get("config.max_speed");
        let deadline = h.engine.deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_millis(1000));

        tokio::time::sleep_until(deadline).await;
        h.engine.on_timeout();
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::Timeout));
        assert_eq!(h.engine.counters().timeouts, 1);
        assert_eq!(h.events().iter().filter(|e| **e == DriverEvent::Disconnected).count(), 1);

        // next request was transmitted straight away
        assert_eq!(h.written().last(), Some(&[0x07, 0x10, 0x00]));
        h.engine.on_timeout();
        assert_eq!(second.try_recv().unwrap(), Err(RequestError::Timeout));
        assert!(h.events().iter().all(|e| *e != DriverEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_input_discarded_before_write_and_on_timeout() {
        let mut h = Harness::new();
        let _first = h.get("meters.hours");
        assert_eq!(h.demo.discard_count(), 1);

        h.reply(&[0x01, 0, 0]);
        assert_eq!(h.demo.discard_count(), 2);

        // nothing queued behind it, so only the timeout discards
        h.engine.on_timeout();
        assert_eq!(h.demo.discard_count(), 3);
        assert_eq!(h.written().len(), 2);

        // a late reply after the timeout is not matched to anything
        h.reply(&[0x2C, 0, 0]);
        assert_eq!(h.engine.counters().received, 1);
    }

    #[test]
    fn test_write_failure_fails_request() {
        let mut h = Harness::new();
        h.demo.fail_writes(true);
        let mut first = h.get("status.pwm");
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::TransportClosed));
        assert_eq!(h.engine.deadline(), None);
        assert_eq!(h.engine.pending(), 0);

        h.demo.fail_writes(false);
        let _second = h.get("status.pwm");
        assert_eq!(h.written(), vec![[0x21, 0x20, 0x00]]);
    }

    #[test]
    fn test_empty_request() {
        let mut h = Harness::new();
        let (tx, mut rx) = oneshot::channel();
        h.engine.enqueue(ParamRequest::Bundle(Vec::new()), Completion::Reply(tx));
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::EmptyRequest));
        assert!(h.written().is_empty());
    }

    #[test]
    fn test_cancel_all_spares_in_flight() {
        let mut h = Harness::new();
        let mut first = h.get("status.pwm");
        let mut second = h.get("meters.hours");
        let mut third = h.get("config.max_speed");

        assert_eq!(h.engine.cancel_all(), 2);
        assert_eq!(second.try_recv().unwrap(), Err(RequestError::Cancelled));
        assert_eq!(third.try_recv().unwrap(), Err(RequestError::Cancelled));

        h.reply(&[0x80, 0, 0]);
        assert!(first.try_recv().unwrap().is_ok());
        assert_eq!(h.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_keeps_queue_for_reopen() {
        let mut h = Harness::new();
        let mut first = h.get("status.pwm");
        let mut second = h.get("meters.hours");
        h.events();

        h.demo.unplug();
        h.deliver();
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.engine.counters().port_closed, 1);
        assert_eq!(h.events(), vec![DriverEvent::Close]);

        // the in-flight item still resolves through its deadline
        h.engine.on_timeout();
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::Timeout));
        assert_eq!(h.written().len(), 1);

        h.demo.plug_in();
        let (tx, rx) = mpsc::unbounded_channel();
        h.transport_rx = rx;
        h.engine.open(tx).unwrap();
        assert_eq!(h.written(), vec![[0x21, 0x20, 0x00], [0x07, 0x62, 0x00]]);

        h.reply(&[0x00, 0, 0]);
        h.reply(&[0x0C, 0, 0]);
        assert_eq!(second.try_recv().unwrap(), Ok(Reading::Value(Value::Number(12))));
    }

    #[test]
    fn test_ping_only_when_idle() {
        let mut h = Harness::new();
        let heartbeat = h.registry.lookup("status.pwm").unwrap();

        h.engine.ping(&heartbeat);
        assert_eq!(h.written(), vec![[0x21, 0x20, 0x00]]);
        h.engine.ping(&heartbeat);
        assert_eq!(h.written().len(), 1);

        h.reply(&[0x80, 0, 0]);
        assert!(h.engine.state().is_connected());
        assert_eq!(h.engine.pending(), 0);
    }

    #[test]
    fn test_transport_error_is_counted_and_forwarded() {
        let mut h = Harness::new();
        h.events();
        h.demo.raise_error("framing error");
        h.deliver();
        assert_eq!(h.engine.counters().port_errors, 1);
        assert_eq!(h.events(), vec![DriverEvent::Error("framing error".into())]);
        assert!(h.engine.state().is_open());
    }

    #[test]
    fn test_deliberate_close_cancels_everything() {
        let mut h = Harness::new();
        let mut first = h.get("status.pwm");
        let mut second = h.get("meters.hours");
        h.engine.close();
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::Cancelled));
        assert_eq!(second.try_recv().unwrap(), Err(RequestError::Cancelled));
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.engine.counters().port_closed, 0);
        // late close notification from the old session is ignored
        assert!(!h.engine.on_closed());
    }

    #[test]
    fn test_shutdown_fails_pending_with_stopped() {
        let mut h = Harness::new();
        let mut first = h.get("status.pwm");
        h.engine.shutdown();
        assert_eq!(first.try_recv().unwrap(), Err(RequestError::Stopped));
        assert!(!h.demo.is_open());
    }
}
