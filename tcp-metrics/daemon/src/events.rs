//! Event processing from eBPF ring buffers
//!
//! One reader task per kernel ring buffer decodes records and pushes them
//! into a bounded [`EventChannel`]; a single collector task drains the
//! channel into the [`MetricsCollector`].
//!
//! Shutdown is ordered: readers stop first, then the collector drains
//! whatever is still queued, so the final report sees every delivered record.

use crate::{
    channel::EventChannel,
    collector::MetricsCollector,
    loader::StatsReader,
    types::{
        kernel::{WireError, WireRecord},
        CapturedEvent,
    },
};
use aya::maps::{MapData, RingBuf};
use log::{debug, error, info, warn};
use std::{os::fd::AsRawFd, sync::Arc, time::Duration};
use tcp_metrics_common::capture::{EventSink, Submit};
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::interval,
};

/// Decode one ring buffer record and submit it
///
/// Bytes past the record size are ignored.
pub fn forward_record<R>(
    bytes: &[u8],
    channel: &EventChannel<CapturedEvent>,
) -> Result<Submit, WireError>
where
    R: WireRecord + Into<CapturedEvent>,
{
    let record = R::decode(bytes)?;
    Ok(channel.submit(&record.into()))
}

/// Event processor that reads from ring buffers
pub struct EventProcessor {
    collector: Arc<Mutex<MetricsCollector>>,
    channel: EventChannel<CapturedEvent>,
    receiver: Option<mpsc::Receiver<CapturedEvent>>,
    readers: Vec<JoinHandle<()>>,
    collector_task: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
    verbose: bool,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `collector` - Shared metrics collector
    /// * `channel_capacity` - Records buffered between readers and collector
    /// * `verbose` - Enable verbose logging
    pub fn new(
        collector: Arc<Mutex<MetricsCollector>>,
        channel_capacity: usize,
        verbose: bool,
    ) -> Self {
        let (channel, receiver) = EventChannel::bounded(channel_capacity);
        Self {
            collector,
            channel,
            receiver: Some(receiver),
            readers: Vec::new(),
            collector_task: None,
            reporter: None,
            verbose,
        }
    }

    /// Records dropped by the userspace channel so far
    pub fn channel_lost(&self) -> u64 {
        self.channel.lost()
    }

    /// Spawn a reader for one ring buffer carrying `R` records
    ///
    /// # Arguments
    ///
    /// * `name` - Map name, for logging
    /// * `ring` - Ring buffer taken from the loader
    pub fn spawn_ring_reader<R>(&mut self, name: &'static str, mut ring: RingBuf<MapData>)
    where
        R: WireRecord + Into<CapturedEvent> + Send + 'static,
    {
        let channel = self.channel.clone();
        let verbose = self.verbose;

        info!("Spawning event reader for {}", name);

        let reader = tokio::spawn(async move {
            let async_fd = match AsyncFd::new(ring.as_raw_fd()) {
                Ok(fd) => fd,
                Err(e) => {
                    error!("Failed to create AsyncFd for {}: {}", name, e);
                    return;
                }
            };

            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Error waiting for {} readability: {}", name, e);
                        break;
                    }
                };

                while let Some(item) = ring.next() {
                    match forward_record::<R>(&item, &channel) {
                        Ok(Submit::Delivered) => {}
                        Ok(Submit::Dropped) => {
                            if verbose {
                                debug!("{}: channel full, record dropped", name);
                            }
                        }
                        Err(e) => warn!("{}: skipping record: {}", name, e),
                    }
                }

                guard.clear_ready();
            }
        });
        self.readers.push(reader);
    }

    /// Spawn the task draining the channel into the collector
    ///
    /// Returns false if the collector task was already spawned.
    pub fn spawn_collector(&mut self) -> bool {
        let mut receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => return false,
        };
        let collector = Arc::clone(&self.collector);
        let verbose = self.verbose;

        self.collector_task = Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if verbose {
                    debug!("Event: {:?}", event);
                }
                collector.lock().await.add_event(&event);
            }
        }));
        true
    }

    /// Spawn progress reporter
    ///
    /// Creates a task that periodically reports collection progress and
    /// loss counters.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    /// * `stats` - Kernel-side counters
    pub fn spawn_progress_reporter(&mut self, interval_secs: u64, stats: Arc<Mutex<StatsReader>>) {
        let collector = Arc::clone(&self.collector);
        let lost = self.channel.loss_counter();

        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                ticker.tick().await;

                let (events, connections) = {
                    let collector = collector.lock().await;
                    (collector.event_count(), collector.connection_count())
                };
                let kernel_dropped = match stats.lock().await.snapshot() {
                    Ok(snapshot) => snapshot.total_dropped(),
                    Err(e) => {
                        warn!("Failed to read capture stats: {}", e);
                        0
                    }
                };

                info!(
                    "📈 Progress: {} events collected, {} unique connections, {} dropped in kernel, {} dropped in userspace",
                    events,
                    connections,
                    kernel_dropped,
                    lost.load(std::sync::atomic::Ordering::Relaxed)
                );
            }
        }));
    }

    /// Stop the readers and drain the channel into the collector
    ///
    /// Returns the number of records the channel dropped. Once this
    /// returns, the collector holds every record that was delivered.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }

        // Each reader owns a sender; the task must be gone before the
        // channel can close.
        for reader in self.readers.drain(..) {
            reader.abort();
            if let Err(e) = reader.await {
                if !e.is_cancelled() {
                    warn!("Ring buffer reader failed: {}", e);
                }
            }
        }

        let lost = self.channel.loss_counter();
        let collector_task = self.collector_task.take();
        drop(self);

        if let Some(task) = collector_task {
            if let Err(e) = task.await {
                warn!("Collector task failed: {}", e);
            }
        }

        info!("Event processing stopped");
        lost.load(std::sync::atomic::Ordering::Relaxed)
    }
}
