use std::collections::HashMap;
use std::sync::Arc;

use chart_core::Event;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::dispatcher::Dispatcher;

/// Counters reported when the router stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Events handed to an extension lane
    pub routed: u64,
    /// Events dropped because no extension was registered for them
    pub unknown: u64,
    /// Lanes started, including restarts
    pub lanes: u64,
}

/// Queue depth of one extension lane unless configured otherwise
pub const DEFAULT_LANE_CAPACITY: usize = 64;

/// Consumes the shared event channel and feeds one lane per extension
///
/// Each lane is a task that dispatches its extension's events one at a time
/// in arrival order; lanes of different extensions run concurrently. Lanes
/// are bounded: when one is full the router waits, the shared channel fills
/// up and producers block in `EventBus::publish`.
pub struct Router {
    dispatcher: Arc<Dispatcher>,
    lane_capacity: usize,
    span: Span,
}

impl Router {
    /// Create a new router delivering to the given dispatcher
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_span(dispatcher, tracing::info_span!("router"))
    }

    pub fn with_span(dispatcher: Arc<Dispatcher>, span: Span) -> Self {
        Self {
            dispatcher,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            span,
        }
    }

    /// Set how many events may wait in one extension's lane.
    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    /// Spawn the router task
    ///
    /// Once `shutdown` fires the channel is closed to new events; events
    /// already queued are still delivered before the task finishes.
    pub fn spawn(
        self,
        receiver: mpsc::Receiver<Event>,
        shutdown: CancellationToken,
    ) -> JoinHandle<RouterStats> {
        let span = self.span.clone();
        tokio::spawn(self.run(receiver, shutdown).instrument(span))
    }

    pub async fn run(
        self,
        mut receiver: mpsc::Receiver<Event>,
        shutdown: CancellationToken,
    ) -> RouterStats {
        info!(lane_capacity = self.lane_capacity, "router started");

        let mut lanes: HashMap<String, mpsc::Sender<Event>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut stats = RouterStats::default();
        let mut closing = false;

        loop {
            let event = tokio::select! {
                event = receiver.recv() => event,
                _ = shutdown.cancelled(), if !closing => {
                    closing = true;
                    receiver.close();
                    debug!("router draining queued events");
                    continue;
                }
            };

            match event {
                Some(event) => self.route(event, &mut lanes, &mut tasks, &mut stats).await,
                None => {
                    info!("router channel closed");
                    break;
                }
            }
        }

        // Dropping the senders lets every lane finish its backlog and exit.
        drop(lanes);
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "lane task failed");
            }
        }

        info!(
            routed = stats.routed,
            unknown = stats.unknown,
            lanes = stats.lanes,
            "router stopped"
        );
        stats
    }

    async fn route(
        &self,
        event: Event,
        lanes: &mut HashMap<String, mpsc::Sender<Event>>,
        tasks: &mut JoinSet<()>,
        stats: &mut RouterStats,
    ) {
        if !self.dispatcher.contains(&event.target) {
            warn!(
                extension = %event.target,
                event = %event.name,
                "no extension registered for event; dropped"
            );
            stats.unknown += 1;
            return;
        }

        let event = match lanes.get(&event.target) {
            Some(lane) => match lane.send(event).await {
                Ok(()) => {
                    stats.routed += 1;
                    return;
                }
                // The lane task ended abnormally; start a fresh one.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let target = event.target.clone();
        let lane = self.spawn_lane(&target, tasks);
        stats.lanes += 1;
        if lane.send(event).await.is_ok() {
            stats.routed += 1;
        }
        lanes.insert(target, lane);
    }

    fn spawn_lane(&self, extension: &str, tasks: &mut JoinSet<()>) -> mpsc::Sender<Event> {
        let (tx, mut rx) = mpsc::channel::<Event>(self.lane_capacity);
        let dispatcher = Arc::clone(&self.dispatcher);
        let span = tracing::debug_span!(parent: &self.span, "lane", extension = %extension);

        tasks.spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    let name = event.name.clone();
                    match dispatcher.dispatch(event).await {
                        Ok(report) if report.is_noop() => {
                            trace!(event = %name, state = %report.current, "no transition matched");
                        }
                        Ok(report) => {
                            debug!(event = %name, from = %report.previous, to = %report.current, "event applied");
                        }
                        Err(err) => warn!(event = %name, error = %err, "dispatch failed"),
                    }
                }
            }
            .instrument(span),
        );
        tx
    }
}
