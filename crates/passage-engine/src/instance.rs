//! One running tunnel: the accept loop and every task under it.

use chrono::{DateTime, Utc};
use passage_mux::MuxSession;
use passage_proto::{OwnerId, TunnelId};
use passage_transport::{load_tls_acceptor, StreamAcceptor, TcpAcceptor, WsAcceptor};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::counters::{CounterSnapshot, TunnelCounters};
use crate::model::{Transport, TunnelSpec};
use crate::relay::relay;
use crate::udp::UdpTunnel;
use crate::EngineError;

/// Consecutive accept failures spanning more than this window are a
/// persistent I/O failure; the instance gives up.
const ACCEPT_ERROR_WINDOW: Duration = Duration::from_secs(5);

/// Pause after a failed accept so a broken listener cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Extra wait after force-closing relays during a stop.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// How the data-plane tasks of an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Stop was requested; everything drained.
    Clean,
    /// The accept loop or transport failed permanently.
    Failed(String),
}

/// Handle to one running data-plane instance.
///
/// Holds the counters, the stop signals, and a completion channel the
/// manager watches for unexpected exits. Dropping the handle does not
/// stop the tasks; call [`TunnelInstance::stop_and_wait`].
pub struct TunnelInstance {
    tunnel_id: TunnelId,
    owner: OwnerId,
    spec: TunnelSpec,
    local_addr: SocketAddr,
    started_at: DateTime<Utc>,
    last_ping: RwLock<DateTime<Utc>>,
    counters: Arc<TunnelCounters>,
    /// Stops the accept loop; relays keep draining.
    cancel: CancellationToken,
    /// Force-closes every relay; pulled after the stop grace expires.
    force: CancellationToken,
    done: watch::Receiver<Option<ExitStatus>>,
}

impl TunnelInstance {
    /// Validate the spec, bind the listen endpoint, and start the
    /// accept loop. Bind and TLS-load failures surface here so the
    /// caller can report a failed start; everything after runs in
    /// background tasks.
    pub async fn spawn(
        tunnel_id: TunnelId,
        owner: OwnerId,
        spec: TunnelSpec,
    ) -> Result<Arc<Self>, EngineError> {
        spec.validate()
            .map_err(|e| EngineError::InvalidSpec(e.to_string()))?;

        let listen_addr = spec.listen.resolve().await.map_err(|e| {
            EngineError::Bind(format!("cannot resolve listen address {}: {e}", spec.listen))
        })?;

        let counters = Arc::new(TunnelCounters::new());
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let tracker = TaskTracker::new();

        let local_addr = match spec.transport {
            Transport::Udp => {
                let tunnel =
                    UdpTunnel::bind(listen_addr, spec.target.clone(), counters.clone()).await?;
                let local_addr = tunnel.local_addr()?;
                let run_cancel = cancel.clone();
                tokio::spawn(finish(
                    tunnel_id,
                    async move { tunnel.run(run_cancel).await },
                    tracker,
                    done_tx,
                ));
                local_addr
            }
            _ => {
                let acceptor = bind_stream_acceptor(&spec, listen_addr).await?;
                let local_addr = acceptor.local_addr().map_err(EngineError::from)?;
                let loop_spec = Arc::new(spec.clone());
                let loop_counters = counters.clone();
                let loop_cancel = cancel.clone();
                let loop_force = force.clone();
                let loop_tracker = tracker.clone();
                tokio::spawn(finish(
                    tunnel_id,
                    async move {
                        run_stream(
                            acceptor,
                            loop_spec,
                            loop_counters,
                            loop_cancel,
                            loop_force,
                            loop_tracker,
                        )
                        .await
                    },
                    tracker,
                    done_tx,
                ));
                local_addr
            }
        };

        info!(%tunnel_id, transport = %spec.transport, listen = %local_addr, target = %spec.target, "tunnel instance started");

        let now = Utc::now();
        Ok(Arc::new(Self {
            tunnel_id,
            owner,
            spec,
            local_addr,
            started_at: now,
            last_ping: RwLock::new(now),
            counters,
            cancel,
            force,
            done: done_rx,
        }))
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        *self.last_ping.read().unwrap()
    }

    /// Refresh liveness; the metrics collector calls this every sample.
    pub fn touch_ping(&self) {
        *self.last_ping.write().unwrap() = Utc::now();
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Signal stop without waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop was requested. Distinguishes a clean shutdown
    /// from an unexpected data-plane exit.
    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the data-plane tasks have fully exited.
    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Wait for the instance to exit, however that happens.
    pub async fn wait_exit(&self) -> ExitStatus {
        let mut done = self.done.clone();
        loop {
            if let Some(status) = done.borrow().clone() {
                return status;
            }
            if done.changed().await.is_err() {
                return ExitStatus::Failed("data-plane task dropped".to_string());
            }
        }
    }

    /// Stop the accept loop, give relays `grace` to drain, then force-
    /// close. Returns `true` when everything drained within the grace
    /// window.
    pub async fn stop_and_wait(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.wait_exit()).await.is_ok() {
            return true;
        }
        warn!(tunnel_id = %self.tunnel_id, "stop grace expired, force-closing relays");
        self.force.cancel();
        let _ = tokio::time::timeout(FORCE_CLOSE_WAIT, self.wait_exit()).await;
        false
    }
}

impl std::fmt::Debug for TunnelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelInstance")
            .field("tunnel_id", &self.tunnel_id)
            .field("transport", &self.spec.transport)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Run the accept loop to completion, wait for every relay to finish,
/// then publish the exit status.
async fn finish<F>(
    tunnel_id: TunnelId,
    run: F,
    tracker: TaskTracker,
    done_tx: watch::Sender<Option<ExitStatus>>,
) where
    F: std::future::Future<Output = Result<(), EngineError>>,
{
    let status = match run.await {
        Ok(()) => ExitStatus::Clean,
        Err(e) => {
            warn!(%tunnel_id, "data plane exited with error: {e}");
            ExitStatus::Failed(e.to_string())
        }
    };
    tracker.close();
    tracker.wait().await;
    debug!(%tunnel_id, "all data-plane tasks drained");
    let _ = done_tx.send(Some(status));
}

async fn bind_stream_acceptor(
    spec: &TunnelSpec,
    addr: SocketAddr,
) -> Result<StreamAcceptor, EngineError> {
    match spec.transport {
        Transport::Tcp | Transport::TcpMux => {
            Ok(StreamAcceptor::Tcp(TcpAcceptor::bind(addr).await?))
        }
        Transport::Ws | Transport::WsMux => Ok(StreamAcceptor::Ws(
            WsAcceptor::bind(addr, spec.token.expose().to_string(), None).await?,
        )),
        Transport::Wss | Transport::WssMux => {
            // validate() guarantees the params exist; readability of the
            // material is only known here, at bind time.
            let params = spec.tls.as_ref().ok_or_else(|| {
                EngineError::InvalidSpec("wss transport without TLS parameters".to_string())
            })?;
            let settings = params
                .to_settings()
                .map_err(|e| EngineError::InvalidSpec(e.to_string()))?;
            let tls = load_tls_acceptor(&settings)
                .map_err(|e| EngineError::Bind(format!("TLS load failed: {e}")))?;
            Ok(StreamAcceptor::Ws(
                WsAcceptor::bind(addr, spec.token.expose().to_string(), Some(tls)).await?,
            ))
        }
        Transport::Udp => unreachable!("udp does not use a stream acceptor"),
    }
}

/// Accept loop for stream transports. Transient accept errors are
/// logged and retried; errors persisting beyond
/// [`ACCEPT_ERROR_WINDOW`] end the instance.
async fn run_stream(
    mut acceptor: StreamAcceptor,
    spec: Arc<TunnelSpec>,
    counters: Arc<TunnelCounters>,
    cancel: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
) -> Result<(), EngineError> {
    let mut first_error_at: Option<Instant> = None;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = acceptor.accept() => res,
        };

        match accepted {
            Ok((duplex, peer)) => {
                first_error_at = None;
                if spec.transport.is_mux() {
                    let spec = spec.clone();
                    let counters = counters.clone();
                    let cancel = cancel.clone();
                    let force = force.clone();
                    let relay_tracker = tracker.clone();
                    tracker.spawn(async move {
                        run_mux_connection(duplex, peer, spec, counters, cancel, force, relay_tracker)
                            .await;
                    });
                } else {
                    let spec = spec.clone();
                    let counters = counters.clone();
                    let force = force.clone();
                    tracker.spawn(async move {
                        relay(duplex, &spec.target, &counters, &force).await;
                    });
                }
            }
            Err(e) => {
                warn!(listen = %spec.listen, "accept error: {e}");
                let now = Instant::now();
                match first_error_at {
                    Some(first) if now.duration_since(first) > ACCEPT_ERROR_WINDOW => {
                        return Err(EngineError::PersistentIo(format!(
                            "accept failing for more than {ACCEPT_ERROR_WINDOW:?}: {e}"
                        )));
                    }
                    Some(_) => {}
                    None => first_error_at = Some(now),
                }
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Serve one multiplexed transport connection: every accepted logical
/// stream gets its own relay. Losing this transport only ends this
/// connection, not the tunnel.
async fn run_mux_connection(
    duplex: passage_transport::BoxedDuplex,
    peer: SocketAddr,
    spec: Arc<TunnelSpec>,
    counters: Arc<TunnelCounters>,
    cancel: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
) {
    let session = MuxSession::server(duplex, spec.mux.to_config());
    debug!(%peer, "mux session established");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Announce shutdown and give streams the go-away grace.
                session.go_away().await;
                break;
            }
            maybe = session.accept_stream() => match maybe {
                Some(stream) => {
                    let spec = spec.clone();
                    let counters = counters.clone();
                    let force = force.clone();
                    tracker.spawn(async move {
                        relay(stream, &spec.target, &counters, &force).await;
                    });
                }
                None => {
                    debug!(%peer, "mux session ended");
                    break;
                }
            }
        }
    }
}
