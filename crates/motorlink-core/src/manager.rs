//! Controllers on several ports
//!
//! A [`ControllerManager`] keeps one running driver per port name. Ports are
//! added with the manager's default line settings (115200 8N1 unless the
//! defaults say otherwise) or with explicit ones, opened straight away and kept
//! open until removed.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{DriverConfig, SerialSettings};
use crate::map::Registry;
use crate::protocol::{MotorController, ProtocolError, SerialTransport, Transport};

/// Open controllers keyed by port name
pub struct ControllerManager {
    registry: Arc<Registry>,
    defaults: DriverConfig,
    controllers: BTreeMap<String, MotorController>,
}

impl ControllerManager {
    /// Every controller reads from `registry`; `defaults` supplies timings and line settings
    pub fn new(registry: impl Into<Arc<Registry>>, defaults: DriverConfig) -> Self {
        Self {
            registry: registry.into(),
            defaults,
            controllers: BTreeMap::new(),
        }
    }

    /// Open `port` with the default line settings
    pub async fn add_port(&mut self, port: &str) -> Result<MotorController, ProtocolError> {
        let serial = SerialSettings {
            port: port.to_string(),
            ..self.defaults.serial.clone()
        };
        self.add_port_with(serial).await
    }

    /// Open a port with explicit line settings
    pub async fn add_port_with(
        &mut self,
        serial: SerialSettings,
    ) -> Result<MotorController, ProtocolError> {
        serial.validate()?;
        let transport = SerialTransport::new(serial.clone());
        self.add_transport(transport, serial).await
    }

    /// Open a controller over any transport, registered under `serial.port`
    ///
    /// A name that is already managed returns the existing controller and
    /// `transport` is dropped unused. A controller whose open fails is shut
    /// down and not kept.
    pub async fn add_transport<T: Transport>(
        &mut self,
        transport: T,
        serial: SerialSettings,
    ) -> Result<MotorController, ProtocolError> {
        if let Some(existing) = self.controllers.get(&serial.port) {
            return Ok(existing.clone());
        }
        let name = serial.port.clone();
        let config = DriverConfig {
            serial,
            ..self.defaults.clone()
        };
        let controller = MotorController::spawn(transport, Arc::clone(&self.registry), config)?;
        if let Err(e) = controller.open().await {
            controller.shutdown().await;
            return Err(e);
        }
        info!(port = %name, managed = self.controllers.len() + 1, "controller added");
        self.controllers.insert(name, controller.clone());
        Ok(controller)
    }

    pub fn get(&self, port: &str) -> Option<&MotorController> {
        self.controllers.get(port)
    }

    /// Managed port names, sorted
    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Stop the controller on `port`; returns false if it was not managed
    pub async fn remove(&mut self, port: &str) -> bool {
        match self.controllers.remove(port) {
            Some(controller) => {
                controller.shutdown().await;
                info!(port, "controller removed");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&mut self) {
        for (_, controller) in std::mem::take(&mut self.controllers) {
            controller.shutdown().await;
        }
    }
}
