//! The application supervisor
//!
//! Owns the managers and the set of live session tasks: creates links and
//! devices up to capacity, respawns sessions as they end (with a 1-second
//! backoff after failed link creation), and runs the idempotent global
//! cleanup when interrupted.

use crate::addressing::{AddressSpaceManager, SharedAddressPool};
use crate::config::{self, Config, Mode};
use crate::device::{self, DeviceManager};
use crate::link::{self, LinkManager};
use crate::session::Session;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_SERVER_SESSIONS: usize = 10;
const CREATE_BACKOFF: Duration = Duration::from_secs(1);

/// Loads configuration, wires the interrupt handler, and runs to completion
pub async fn run(mode: Mode, config_path: &str) -> crate::Result<()> {
    let config = config::load(config_path, mode)?;
    let app = Application::new(mode, config)?;

    let token = app.shutdown_token();
    let _handler = ctrlc2::set_handler(move || {
        tracing::info!("interrupted, shutting down");
        token.cancel();
        true
    })?;

    app.run().await
}

pub struct Application {
    mode: Mode,
    link_manager: Box<dyn LinkManager>,
    device_manager: Box<dyn DeviceManager>,
    ip_pool: Option<SharedAddressPool>,
    config: Config,
    shutdown: CancellationToken,
}

impl Application {
    pub fn new(mode: Mode, config: Config) -> crate::Result<Self> {
        let link_manager = link::create_link_manager(mode, &config.link)?;
        let device_manager = device::create_device_manager(&config.device)?;
        let ip_pool = match mode {
            Mode::Server => {
                let network = config.overlay_network()?;
                Some(Arc::new(Mutex::new(AddressSpaceManager::new(network))))
            }
            Mode::Client => None,
        };

        Ok(Application {
            mode,
            link_manager,
            device_manager,
            ip_pool,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(mut self) -> crate::Result<()> {
        self.link_manager.setup().await?;
        self.device_manager.setup().await?;

        // the client carries a stable name hint across reconnects
        let session_name = match self.mode {
            Mode::Client => Some(Uuid::new_v4().simple().to_string()),
            Mode::Server => None,
        };
        let capacity = match self.mode {
            Mode::Client => 1,
            Mode::Server => MAX_SERVER_SESSIONS,
        };

        let mut sessions: JoinSet<()> = JoinSet::new();
        'supervise: loop {
            while sessions.len() < capacity {
                if self.shutdown.is_cancelled() {
                    break 'supervise;
                }
                match self.spawn_session(&session_name, &mut sessions).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break 'supervise,
                            _ = tokio::time::sleep(CREATE_BACKOFF) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!("cannot create session: {}", e);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break 'supervise,
                            _ = tokio::time::sleep(CREATE_BACKOFF) => {}
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = sessions.join_next() => {
                    if joined.is_some() {
                        tracing::info!("session ended, respawning");
                    }
                }
            }
        }

        self.cleanup(sessions).await;
        Ok(())
    }

    /// Attempts one link + device + session; `Ok(false)` asks for backoff
    async fn spawn_session(
        &mut self,
        session_name: &Option<String>,
        sessions: &mut JoinSet<()>,
    ) -> crate::Result<bool> {
        let link = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(false),
            result = self.link_manager.create() => match result? {
                Some(link) => link,
                None => return Ok(false),
            },
        };

        let device = self.device_manager.create().await?;
        let name = session_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let session = Session::new(
            self.mode,
            name,
            device,
            link,
            &self.config,
            self.ip_pool.clone(),
        );
        tracing::info!("starting session {}", session.name());

        sessions.spawn(session.run(self.shutdown.child_token()));
        Ok(true)
    }

    /// Global cleanup; every part is independent so this stays idempotent
    async fn cleanup(mut self, mut sessions: JoinSet<()>) {
        tracing::info!("cleaning up...");
        self.shutdown.cancel();
        while sessions.join_next().await.is_some() {}
        self.link_manager.cleanup().await;
        self.device_manager.cleanup().await;
    }
}
