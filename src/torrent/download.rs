//! Download coordinator
//!
//! Owns the whole run: tracker fan-out, swarm dialing, magnet metadata
//! bootstrap, piece scheduling across per-peer workers, assembly of
//! the payload buffer, and checksum-verified writeout.
//!
//! Scheduling is a shared job queue drained by one worker task per
//! peer session. A worker that hits a piece its peer doesn't have puts
//! the job back and keeps going; a worker whose session fails puts the
//! job back and retires. The assembler closes the queue once every
//! piece has arrived, and the remaining workers drain out.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use md5::Md5;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, Notify};

use super::metadata;
use super::metainfo::{Sha1Hash, TorrentDescriptor};
use super::peer::PeerSession;
use super::tracker::{generate_peer_id, TrackerClient};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// One piece to download
#[derive(Debug, Clone)]
struct PieceJob {
    index: u32,
    length: usize,
    hash: Sha1Hash,
}

/// One verified piece, ready for assembly
struct PieceResult {
    index: u32,
    data: Vec<u8>,
}

/// Closable multi-producer/multi-consumer queue of piece jobs.
///
/// Workers pop, and push back jobs they failed to complete. Closing is
/// the only termination signal: a pop on a closed, drained queue
/// returns `None`.
struct JobQueue {
    jobs: Mutex<VecDeque<PieceJob>>,
    notify: Notify,
    closed: AtomicBool,
}

impl JobQueue {
    fn new(jobs: impl IntoIterator<Item = PieceJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().collect()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Put a job (back) on the queue.
    fn push(&self, job: PieceJob) {
        self.jobs.lock().push_back(job);
        self.notify.notify_one();
    }

    /// Take the next job, waiting if the queue is momentarily empty.
    /// Returns `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<PieceJob> {
        loop {
            // register for wakeups before checking, so a push or close
            // between the check and the await cannot be missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.jobs.lock().pop_front() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A prepared download: descriptor resolved, swarm connected, metadata
/// present
pub struct Download {
    descriptor: TorrentDescriptor,
    peer_id: [u8; 20],
    sessions: Vec<PeerSession>,
}

impl Download {
    /// Prepare a download from a source string (`.torrent` path or
    /// magnet link): resolve the descriptor, gather peers from every
    /// tracker, open sessions to the swarm, and for magnets fetch the
    /// info dictionary from a peer.
    pub async fn new(source: &str, config: ClientConfig) -> Result<Self> {
        let mut descriptor = TorrentDescriptor::load(source)?;
        let peer_id = generate_peer_id();

        let endpoints = gather_endpoints(&descriptor, peer_id, &config).await?;
        tracing::info!("{} unique peer endpoints", endpoints.len());

        let mut sessions =
            dial_swarm(&endpoints, descriptor.info_hash, peer_id, &config).await;
        if sessions.is_empty() {
            return Err(ClientError::NoPeers);
        }
        tracing::info!("{} peer sessions open", sessions.len());

        if descriptor.needs_info() {
            let info = bootstrap_metadata(&mut sessions, &descriptor.info_hash).await?;
            descriptor.append_info(&info)?;
        }

        Ok(Self {
            descriptor,
            peer_id,
            sessions,
        })
    }

    /// The resolved descriptor.
    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.descriptor
    }

    /// The peer id announced to trackers and peers.
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Number of open peer sessions.
    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Download every piece, assemble the payload, verify per-file
    /// checksums and write the files under `out_dir`.
    pub async fn run(self, out_dir: impl AsRef<Path>) -> Result<()> {
        let Self {
            descriptor,
            sessions,
            ..
        } = self;
        let num_pieces = descriptor.piece_hashes.len();

        let queue = Arc::new(JobQueue::new(descriptor.piece_hashes.iter().enumerate().map(
            |(index, hash)| PieceJob {
                index: index as u32,
                length: descriptor.piece_len(index),
                hash: *hash,
            },
        )));
        let (results_tx, mut results_rx) = mpsc::channel::<PieceResult>(1);

        let mut workers = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            let queue = Arc::clone(&queue);
            let results = results_tx.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = queue.pop().await {
                    match session.get_piece(job.index, job.length, &job.hash).await {
                        Ok(data) => {
                            let result = PieceResult {
                                index: job.index,
                                data,
                            };
                            if results.send(result).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            queue.push(job);
                            if error.is_soft() {
                                // give another worker a chance at the
                                // requeued job before popping again
                                tokio::task::yield_now().await;
                                continue;
                            }
                            tracing::warn!("retiring peer {}: {}", session.addr(), error);
                            break;
                        }
                    }
                }
            }));
        }
        // workers hold the only remaining result senders
        drop(results_tx);

        let mut buf = vec![0u8; descriptor.total_length];
        for finished in 0..num_pieces {
            let Some(result) = results_rx.recv().await else {
                // every worker retired with pieces still missing
                queue.close();
                return Err(ClientError::NoPeers);
            };

            let offset = result.index as usize * descriptor.piece_length;
            buf[offset..offset + result.data.len()].copy_from_slice(&result.data);
            println!(
                "{:.2}% complete",
                (finished + 1) as f64 / num_pieces as f64 * 100.0
            );
        }

        queue.close();
        join_all(workers).await;

        write_output(&descriptor, &buf, out_dir.as_ref()).await
    }
}

/// Query every tracker concurrently and union the endpoints.
async fn gather_endpoints(
    descriptor: &TorrentDescriptor,
    peer_id: [u8; 20],
    config: &ClientConfig,
) -> Result<Vec<SocketAddrV4>> {
    let client = Arc::new(TrackerClient::new(peer_id, config.clone())?);
    let gathered = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::with_capacity(descriptor.tracker_urls.len());
    for url in descriptor.tracker_urls.clone() {
        let client = Arc::clone(&client);
        let gathered = Arc::clone(&gathered);
        let info_hash = descriptor.info_hash;
        let port = config.port;

        tasks.push(tokio::spawn(async move {
            match client.get_peers(&url, &info_hash, port).await {
                Ok(peers) => {
                    tracing::info!("tracker {} returned {} peers", url, peers.len());
                    gathered.lock().extend(peers);
                }
                Err(error) => tracing::warn!("tracker {} failed: {}", url, error),
            }
        }));
    }
    join_all(tasks).await;

    // structural dedup, preserving discovery order
    let gathered = gathered.lock();
    let mut seen = HashSet::new();
    Ok(gathered
        .iter()
        .copied()
        .filter(|addr| seen.insert(*addr))
        .collect())
}

/// Dial every endpoint concurrently, keeping the sessions that survive
/// the open sequence.
async fn dial_swarm(
    endpoints: &[SocketAddrV4],
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    config: &ClientConfig,
) -> Vec<PeerSession> {
    let tasks: Vec<_> = endpoints
        .iter()
        .copied()
        .map(|addr| {
            let config = config.clone();
            tokio::spawn(async move {
                match PeerSession::connect(addr, info_hash, peer_id, config).await {
                    Ok(session) => Some(session),
                    Err(error) => {
                        tracing::debug!("peer {} failed to open: {}", addr, error);
                        None
                    }
                }
            })
        })
        .collect();

    join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok().flatten())
        .collect()
}

/// Ask sessions for the info dictionary one by one; first win counts.
async fn bootstrap_metadata(
    sessions: &mut [PeerSession],
    info_hash: &Sha1Hash,
) -> Result<Vec<u8>> {
    for session in sessions.iter_mut() {
        match metadata::fetch_metadata(session, info_hash).await {
            Ok(bytes) => return Ok(bytes),
            Err(error) => {
                tracing::warn!("metadata from {} failed: {}", session.addr(), error)
            }
        }
    }
    Err(ClientError::MetadataUnavailable)
}

/// Slice the assembled buffer into files, verifying optional per-file
/// checksums, and write them under `out_dir`.
async fn write_output(
    descriptor: &TorrentDescriptor,
    buf: &[u8],
    out_dir: &Path,
) -> Result<()> {
    let mut used = 0usize;
    for file in &descriptor.files {
        let out_path = out_dir.join(&file.path);
        let contents = &buf[used..used + file.length];

        if let Some(expected) = &file.sha1 {
            if Sha1::digest(contents).as_slice() != expected.as_slice() {
                return Err(ClientError::IntegrityFailure(format!(
                    "file {}",
                    file.path.display()
                )));
            }
        }
        if let Some(expected) = &file.md5 {
            if Md5::digest(contents).as_slice() != expected.as_slice() {
                return Err(ClientError::IntegrityFailure(format!(
                    "file {}",
                    file.path.display()
                )));
            }
        }

        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::info!("writing {} bytes to {}", file.length, out_path.display());
        tokio::fs::write(&out_path, contents).await?;

        used += file.length;
    }

    Ok(())
}
