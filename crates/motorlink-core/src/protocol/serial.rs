//! Serial port handling
//!
//! Port discovery and the tokio-serial backed [`Transport`].

use futures::StreamExt;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::{EventSender, Frame, ProtocolError, ResponseDecoder, Transport, TransportEvent};
use crate::config::{Parity, SerialSettings};

/// A port a controller could be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or name, e.g. "/dev/ttyUSB0" or "COM3"
    pub name: String,

    /// Set when the OS reports the port as a USB adapter
    pub usb: Option<UsbAdapter>,
}

/// USB identity of a serial adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbAdapter {
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usb: None,
        }
    }

    fn device(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// USB adapters and the ttyUSB/ttyACM nodes they create
    pub fn is_adapter(&self) -> bool {
        let device = self.device();
        self.usb.is_some() || device.starts_with("ttyUSB") || device.starts_with("ttyACM")
    }

    /// Adapters first, then by name stem and numeric suffix ("ttyUSB2" < "ttyUSB10")
    fn listing_order(&self) -> (bool, String, u64) {
        let device = self.device();
        let split = device.find(|c: char| c.is_ascii_digit()).unwrap_or(device.len());
        let (stem, number) = device.split_at(split);
        (
            !self.is_adapter(),
            stem.to_string(),
            number.parse().unwrap_or(u64::MAX),
        )
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let usb = match info.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbAdapter {
                vid: usb.vid,
                pid: usb.pid,
                product: usb.product,
                serial_number: usb.serial_number,
            }),
            _ => None,
        };
        Self {
            name: info.port_name,
            usb,
        }
    }
}

/// Ports the OS knows about, adapters first
pub fn list_ports() -> Vec<PortInfo> {
    let found = serialport::available_ports().unwrap_or_else(|e| {
        debug!("port enumeration failed: {}", e);
        Vec::new()
    });
    let mut ports: BTreeMap<String, PortInfo> = found
        .into_iter()
        .map(|info| (info.port_name.clone(), PortInfo::from(info)))
        .collect();

    // Enumeration misses adapters when udev is absent (containers, minimal images)
    #[cfg(target_os = "linux")]
    for name in adapter_nodes() {
        ports.entry(name.clone()).or_insert_with(|| PortInfo::named(name));
    }

    let mut ports: Vec<PortInfo> = ports.into_values().collect();
    ports.sort_by_cached_key(PortInfo::listing_order);
    ports
}

#[cfg(target_os = "linux")]
fn adapter_nodes() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB") || name.starts_with("ttyACM"))
        .map(|name| format!("/dev/{}", name))
        .collect()
}

fn line_settings(
    settings: &SerialSettings,
) -> Result<(tokio_serial::DataBits, tokio_serial::StopBits, tokio_serial::Parity), ProtocolError>
{
    settings.validate()?;
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    Ok((data_bits, stop_bits, parity))
}

/// Frame incoming bytes and forward them to the driver until the stream ends
///
/// A partial frame followed by `gap` of silence is forwarded as-is, so a short
/// reply fails its request instead of waiting for its deadline.
async fn read_responses<R>(reader: R, events: EventSender, stale: Arc<AtomicBool>, gap: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, ResponseDecoder::with_stale_flag(stale));
    loop {
        let next = if frames.read_buffer().is_empty() {
            frames.next().await
        } else {
            match tokio::time::timeout(gap, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let mut tail = frames.read_buffer_mut().split();
                    match frames.decoder_mut().flush(&mut tail) {
                        Some(partial) => Some(Ok(partial)),
                        None => continue,
                    }
                }
            }
        };

        match next {
            Some(Ok(bytes)) => {
                if events.send(TransportEvent::Data(bytes)).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
            None => break,
        }
    }
    let _ = events.send(TransportEvent::Closed);
}

/// Serial port transport
///
/// Opening spawns a reader task that frames incoming bytes and a writer task
/// that drains queued frames, so `write` never blocks the driver.
pub struct SerialTransport {
    settings: SerialSettings,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    tasks: Vec<JoinHandle<()>>,
    /// Raised by `discard_input`, cleared by the reader once it drops old bytes
    stale: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            writer: None,
            tasks: Vec::new(),
            stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Run a session over an already open byte stream
    pub(crate) fn attach<S>(&mut self, stream: S, events: EventSender)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.close();
        self.stale.store(false, Ordering::Release);
        let (reader, mut writer) = tokio::io::split(stream);

        let reader_task = tokio::spawn(read_responses(
            reader,
            events.clone(),
            Arc::clone(&self.stale),
            self.settings.response_gap(),
        ));

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let result = async {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = result {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            }
        });

        self.writer = Some(frame_tx);
        self.tasks = vec![reader_task, writer_task];
    }
}

impl Transport for SerialTransport {
    fn describe(&self) -> String {
        self.settings.port.clone()
    }

    fn open(&mut self, events: EventSender) -> Result<(), ProtocolError> {
        self.close();
        let (data_bits, stop_bits, parity) = line_settings(&self.settings)?;

        let mut stream = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

        // Keep DTR asserted so boards with auto-reset circuits don't reboot
        if let Err(e) = stream.write_data_terminal_ready(true) {
            warn!(port = %self.settings.port, "failed to set DTR high: {} (continuing)", e);
        }

        self.attach(stream, events);
        debug!(port = %self.settings.port, baud = self.settings.baud_rate, "serial port opened");
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let writer = self.writer.as_ref().ok_or(ProtocolError::TransportClosed)?;
        writer.send(*frame).map_err(|_| ProtocolError::TransportClosed)
    }

    fn discard_input(&mut self) {
        self.stale.store(true, Ordering::Release);
    }

    fn close(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| !w.is_closed())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
