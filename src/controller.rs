//! Owner of the physical connection and its multiplexer
//!
//! All connects, reconnects and the final shutdown go through here. A
//! reconnect cancels every download riding on the old connection before the
//! old connection is closed.

use crate::channel::{Channel, DownloadChannel};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionListener, ConnectionRequest};
use crate::download::{ClientDownload, DownloadListener};
use crate::error::{Error, Result};
use crate::metadata::TransferMetadata;
use crate::mux::Multiplexer;
use crate::orchestrator::Orchestrator;
use crate::packet::DownloadPacket;
use crate::session::{PublicKey, SessionKey, SessionKeyArrangement, SessionKeyBuilder};
use crate::transfer_log::TransferLog;
use crate::ui::Ui;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

struct Link {
    connection: Connection,
    mux: Arc<Multiplexer>,
}

pub struct ConnectionController {
    config: ClientConfig,
    ui: Arc<dyn Ui>,
    orchestrator: Orchestrator,
    public_key: Option<PublicKey>,
    link: Mutex<Option<Link>>,
    // One connect at a time
    connect_gate: Mutex<()>,
    stopping: AtomicBool,
}

impl ConnectionController {
    pub fn new<U: Ui + 'static>(config: ClientConfig, ui: Arc<U>) -> Result<Arc<Self>> {
        let public_key = match &config.public_key {
            Some(path) => {
                let key = PublicKey::load(path)?;
                info!(fingerprint = %key.fingerprint(), "server public key loaded");
                Some(key)
            }
            None => None,
        };
        let mut orchestrator =
            Orchestrator::new(ui.clone(), config.header_timeout(), config.queue_policy());
        if let Some(path) = &config.transfer_log {
            orchestrator = orchestrator.with_transfer_log(Arc::new(TransferLog::new(path)));
        }
        Ok(Arc::new(Self {
            config,
            ui,
            orchestrator,
            public_key,
            link: Mutex::new(None),
            connect_gate: Mutex::new(()),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to `host:port`, replacing any existing connection.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let _gate = self.connect_gate.lock();
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::interrupted("connect during shutdown"));
        }

        let previous = self.link.lock().take();
        if let Some(old) = previous {
            info!(address = %old.connection.address(), "dropping previous connection");
            self.orchestrator.cancel_downloads();
            if let Err(e) = old.connection.close(self.config.close_timeout()) {
                warn!("previous connection did not close cleanly: {}", e);
            }
            self.ui.set_connected(false);
        }

        let mut request = ConnectionRequest::new(host, port);
        if self.public_key.is_some() {
            request = request.with_session_key_builder(self.clone());
        }
        let connection = match request.request(self.config.connect_timeout()) {
            Ok(c) => c,
            Err(e) if e.is_interrupted() => {
                info!(host, port, "connect aborted: {}", e);
                return Ok(());
            }
            Err(e) => {
                error!(host, port, "connect failed: {}", e);
                return Err(e);
            }
        };

        let listener: Weak<dyn ConnectionListener> = Arc::downgrade(self) as Weak<Self>;
        connection.add_listener(listener);
        let mux = connection.attach_multiplexer();
        connection.start()?;

        let address = connection.address();
        let encrypted = connection.is_encrypted();
        *self.link.lock() = Some(Link { connection, mux });
        self.ui.set_connected(true);
        self.ui.show(&format!(
            "Connected to {}{}",
            address,
            if encrypted { " (encrypted)" } else { "" }
        ));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|l| l.connection.is_running())
    }

    pub fn connection_address(&self) -> Option<String> {
        self.link
            .lock()
            .as_ref()
            .map(|l| l.connection.address().to_string())
    }

    pub fn new_metadata(&self, url: impl Into<String>) -> TransferMetadata {
        self.orchestrator.new_metadata(url)
    }

    /// Open a channel, negotiate and start one download.
    ///
    /// Returns false when the download did not start; the reason has been
    /// reported to the UI.
    pub fn request_download_from(
        &self,
        metadata: &mut TransferMetadata,
        listener: Arc<dyn DownloadListener>,
    ) -> bool {
        let mux = self.link.lock().as_ref().map(|l| l.mux.clone());
        let Some(mux) = mux else {
            self.ui.show_error("Not connected");
            return false;
        };

        let channel: DownloadChannel =
            match mux.establish_channel::<DownloadPacket>(self.config.channel_timeout()) {
                Ok(c) => c as DownloadChannel,
                Err(e) => {
                    error!(url = metadata.url(), "could not open download channel: {}", e);
                    self.ui
                        .show_error(&format!("Could not download {}: {}", metadata.url(), e));
                    return false;
                }
            };

        let download = match self.orchestrator.request_download_from(metadata, &channel) {
            Ok(Some(d)) => d,
            Ok(None) => {
                if let Err(e) = channel.send(DownloadPacket::cancel()) {
                    debug!(channel = channel.id(), "cancel not sent: {}", e);
                }
                close_channel(&channel);
                return false;
            }
            Err(e) => {
                error!(url = metadata.url(), "download request failed: {}", e);
                self.ui
                    .show_error(&format!("Could not download {}: {}", metadata.url(), e));
                close_channel(&channel);
                return false;
            }
        };

        download.add_listener(listener);
        let ch = channel.clone();
        download.on_terminal(move |_| close_channel(&ch));

        if let Err(e) = self.orchestrator.start_download(&channel, &download) {
            error!(download = download.id(), "could not start download: {}", e);
            self.ui
                .show_error(&format!("Could not start {}: {}", metadata.url(), e));
            close_channel(&channel);
            return false;
        }
        true
    }

    pub fn downloads(&self) -> Vec<Arc<ClientDownload>> {
        self.orchestrator.registry().snapshot()
    }

    pub fn active_download_count(&self) -> usize {
        self.orchestrator.active_download_count()
    }

    pub fn wait_for_downloads(&self) -> Result<()> {
        self.orchestrator.wait_for_downloads()
    }

    pub fn cancel_downloads(&self) {
        self.orchestrator.cancel_downloads();
    }

    /// Shut everything down. Safe to call more than once and from any thread.
    pub fn exit(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.orchestrator.close();
        self.ui.close();
        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Err(e) = link.connection.close(self.config.close_timeout()) {
                warn!("connection did not close cleanly: {}", e);
            }
        }
    }
}

fn close_channel(channel: &DownloadChannel) {
    if let Err(e) = channel.close() {
        debug!(channel = channel.id(), "channel close: {}", e);
    }
}

impl ConnectionListener for ConnectionController {
    fn closed(&self, connection_id: u64) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let lost = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(l) if l.connection.id() == connection_id => link.take(),
                _ => None,
            }
        };
        // Replaced connections close silently
        if let Some(lost) = lost {
            warn!(address = %lost.connection.address(), "connection lost");
            self.ui.set_connected(false);
            self.ui.alert("Connection to server lost.");
        }
    }

    fn malicious_input(&self, _connection_id: u64, detail: &str) {
        self.ui.alert_error(&format!(
            "The server sent data that does not follow the protocol ({}). \
             The connection may have been tampered with.",
            detail
        ));
    }
}

impl SessionKeyBuilder for ConnectionController {
    fn build_session_key(
        &self,
        arrangement: &mut SessionKeyArrangement<'_>,
    ) -> Result<Option<SessionKey>> {
        let Some(key) = &self.public_key else {
            return Ok(None);
        };
        arrangement
            .set_generate_session_key(true)
            .set_public_key(key.clone());
        arrangement.arrange().map(Some)
    }
}
