//! Stream router: one producer keeping the links alive, one consumer
//! draining the shared queue into the [`Pipeline`].

use crate::core::sample::{parse_frame, Sample};
use crate::link::manager::{DisconnectReport, LinkManager};
use crate::link::transport::Central;
use crate::link::types::{Device, Packet};
use crate::pipeline::Pipeline;
use crate::uploader::FlushOutcome;
use std::io::BufRead;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Anything the consumer can dequeue.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A notification from a live link
    Packet(Packet),
    /// A frame of already-decoded samples from the synthetic feed
    Frame(Vec<(Device, Sample)>),
}

impl From<Packet> for Inbound {
    fn from(packet: Packet) -> Self {
        Inbound::Packet(packet)
    }
}

impl From<Vec<(Device, Sample)>> for Inbound {
    fn from(frame: Vec<(Device, Sample)>) -> Self {
        Inbound::Frame(frame)
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Connect every link, idle until shutdown, then tear everything down.
///
/// Notifications reach the queue from the radio callbacks, not from here.
pub async fn run_producer<C: Central>(
    mut links: LinkManager<C>,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<(Device, DisconnectReport)> {
    tokio::select! {
        results = links.connect_all() => {
            let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
            for (device, result) in &results {
                if let Err(e) = result {
                    error!(device = %device, error = %e, "link down, continuing without it");
                }
            }
            if connected == 0 {
                warn!("no device connected; waiting for shutdown");
            } else {
                info!(connected, "links established");
            }
            wait_for_shutdown(&mut shutdown).await;
        }
        _ = wait_for_shutdown(&mut shutdown) => {
            info!("shutdown requested during link setup");
        }
    }

    let reports = links.disconnect_all().await;
    for (device, report) in &reports {
        if !report.is_clean() {
            warn!(device = %device, failed = ?report.failed_steps, "disconnect incomplete");
        }
    }
    reports
}

/// Drain the queue into `pipeline` until shutdown or until every sender is
/// gone, then run the final flush.
pub async fn run_consumer<T>(
    pipeline: &mut Pipeline,
    mut queue: UnboundedReceiver<T>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> FlushOutcome
where
    T: Into<Inbound>,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = tokio::time::timeout(poll, queue.recv()) => item,
        };

        match item {
            Ok(Some(item)) => dispatch(pipeline, item.into(), Instant::now()),
            Ok(None) => {
                info!("input closed");
                break;
            }
            Err(_) => {}
        }

        pipeline.tick(Instant::now()).await;
    }

    pipeline.shutdown(Instant::now()).await
}

fn dispatch(pipeline: &mut Pipeline, item: Inbound, now: Instant) {
    match item {
        Inbound::Packet(packet) => pipeline.accept_packet(&packet, now),
        Inbound::Frame(frame) => {
            for (device, sample) in frame {
                pipeline.ingest_sample(device, sample, now);
            }
        }
    }
}

/// Read NDJSON sample frames from `reader` on a dedicated thread.
///
/// Unparsable lines are skipped. The thread ends at end of input or when the
/// consumer hangs up, returning the number of frames forwarded.
pub fn spawn_frame_reader<R>(reader: R, queue: UnboundedSender<Inbound>) -> JoinHandle<usize>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        let mut forwarded = 0;
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "synthetic input read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_frame(&line) {
                Ok(frame) => {
                    if queue.send(Inbound::Frame(frame)).is_err() {
                        break;
                    }
                    forwarded += 1;
                }
                Err(e) => debug!(error = %e, "skipped unparsable frame"),
            }
        }
        forwarded
    })
}
