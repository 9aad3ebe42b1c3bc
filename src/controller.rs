//! Top-level wiring of the controller: one event bus, one alarm state
//! machine, one camera arbiter, built from a validated configuration.

use crate::alarm::Alarm;
use crate::camera::CameraArbiter;
use crate::config::HomeguardConfig;
use crate::error::Result;
use crate::events::EventBus;
use std::sync::Arc;
use tracing::info;

pub struct Controller {
    config: HomeguardConfig,
    bus: Arc<EventBus>,
    alarm: Arc<Alarm>,
    camera: Arc<CameraArbiter>,
}

impl Controller {
    /// Build the component graph. Nothing is started and no state is
    /// touched until `start`.
    pub fn new(config: HomeguardConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let camera = Arc::new(CameraArbiter::new());
        let alarm = Alarm::new(&config.alarm, Arc::clone(&bus))?;

        Ok(Self {
            config,
            bus,
            alarm,
            camera,
        })
    }

    /// Restore or initialize the alarm state.
    pub fn start(&self) -> Result<()> {
        info!("Starting homeguard controller");
        self.alarm.start()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn alarm(&self) -> &Arc<Alarm> {
        &self.alarm
    }

    pub fn camera(&self) -> &Arc<CameraArbiter> {
        &self.camera
    }

    pub fn config(&self) -> &HomeguardConfig {
        &self.config
    }

    /// Block until SIGINT or SIGTERM, then return the process exit code.
    pub async fn run(&self) -> Result<i32> {
        info!("Homeguard controller is running (press Ctrl+C to stop)");

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT signal (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM signal");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received SIGINT signal (Ctrl+C)");
        }

        info!("Homeguard controller shutting down");
        Ok(0)
    }
}
