use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::FileLayout;
use crate::peer::PeerSession;
use crate::store::PieceStore;
use crate::torrent::Torrent;
use crate::tracker::{Tracker, generate_peer_id};
use crate::writer::FileWriter;

/// Summary of a finished download.
#[derive(Debug)]
pub struct DownloadReport {
    pub pieces: usize,
    pub bytes: u64,
    pub peers_tried: usize,
}

/// Drives one download end to end: preallocate, announce, run a bounded
/// set of peer sessions, and report the outcome.
pub struct DownloadCoordinator {
    torrent: Arc<Torrent>,
    config: Config,
}

impl DownloadCoordinator {
    pub fn new(torrent: Torrent, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            torrent: Arc::new(torrent),
            config,
        })
    }

    pub async fn run(&self) -> Result<DownloadReport> {
        // Files are sized before any session starts, so positioned writes
        // never race file creation.
        let layout = FileLayout::for_torrent(&self.torrent);
        let total_pieces = layout.num_pieces();
        let total_bytes = layout.total_length();
        let writer = FileWriter::preallocate(layout, &self.config.download_path).await?;
        let store = Arc::new(PieceStore::new(self.torrent.clone(), writer));

        let peer_id = generate_peer_id();
        let tracker = Tracker::new()?;
        let response = tracker
            .announce(&self.torrent, &peer_id, self.config.listen_port)
            .await?;
        if let Some(interval) = response.interval {
            debug!(interval, "tracker suggested re-announce interval");
        }
        let peers = response.peers()?;
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }
        info!(peers = peers.len(), cap = self.config.max_connections, "tracker returned peers");

        let info_hash = self.torrent.info_hash();
        let handles: Vec<_> = peers
            .into_iter()
            .take(self.config.max_connections)
            .map(|peer| {
                let session = PeerSession::new(peer, store.clone(), &self.config);
                tokio::spawn(async move { (peer, session.run(info_hash, peer_id).await) })
            })
            .collect();
        let peers_tried = handles.len();

        let progress = tokio::spawn(progress_loop(store.clone()));

        for joined in join_all(handles).await {
            match joined {
                Ok((peer, Ok(()))) => debug!(%peer, "session finished"),
                Ok((peer, Err(e))) => warn!(%peer, error = %e, "session failed"),
                Err(e) => warn!(error = %e, "session task panicked"),
            }
        }
        progress.abort();

        if let Some(fatal) = store.take_fatal().await {
            return Err(fatal);
        }
        let missing = store.missing_indices().await;
        if missing.is_empty() {
            info!(pieces = total_pieces, bytes = total_bytes, "download complete");
            Ok(DownloadReport {
                pieces: total_pieces,
                bytes: total_bytes,
                peers_tried,
            })
        } else {
            Err(Error::Incomplete { missing })
        }
    }
}

/// Logs verified/total once a second until the download finishes.
async fn progress_loop(store: Arc<PieceStore>) {
    let mut done = store.subscribe_done();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let verified = store.verified_count().await;
                info!(
                    verified = verified,
                    total = store.num_pieces(),
                    "download progress"
                );
            }
            _ = done.changed() => break,
        }
    }
}
