use crate::{
    components::edge::{cache::LatestValueCache, transport::bind_inbound},
    error::TransportError,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives free form JSON chart documents on their own UDP port and keeps
/// only the latest one. Invalid JSON is logged and dropped.
pub struct ChartReceiver {
    bind: SocketAddr,
    latest: Arc<LatestValueCache<serde_json::Value>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChartReceiver {
    /// * `bind`: address to listen on.
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            latest: Arc::new(LatestValueCache::new()),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Bind and start receiving. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        let socket = bind_inbound(self.bind).await?;
        let local = socket.local_addr().unwrap_or(self.bind);

        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(receive_loop(
            socket,
            self.latest.clone(),
            self.cancel.clone(),
        )));
        info!(%local, "chart receiver started");
        Ok(local)
    }

    /// Stop receiving and wait for the loop to end. The latest document is
    /// kept.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!(bind = %self.bind, "chart receiver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Copy of the latest chart document.
    pub fn latest(&self) -> Option<serde_json::Value> {
        self.latest.get()
    }

    /// Parse and store one datagram.
    pub fn handle_datagram(&self, datagram: &[u8]) {
        ingest(&self.latest, datagram);
    }
}

fn ingest(latest: &LatestValueCache<serde_json::Value>, datagram: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(datagram) {
        Ok(document) => {
            debug!(size = datagram.len(), "chart document received");
            latest.put(document);
        }
        Err(error) => warn!(%error, size = datagram.len(), "dropping invalid chart document"),
    }
}

async fn receive_loop(
    socket: UdpSocket,
    latest: Arc<LatestValueCache<serde_json::Value>>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; 65_536];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((size, _)) => ingest(&latest, &buffer[..size]),
                Err(error) => warn!(%error, "chart receive failed"),
            },
        }
    }
}
