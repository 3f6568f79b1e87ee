//! Loopback TCP load balancer over the cluster's API servers.
//!
//! One listener, a set of upstreams with background TCP health probes,
//! bidirectional byte copying per connection. Aggregate health is the OR
//! over upstream liveness. The upstream set is swappable at runtime
//! through the channel handed to [`LoadBalancer::start`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Dial/probe tuning passed at start time.
#[derive(Debug, Clone)]
pub struct LoadBalancerOptions {
    /// Upstream dial timeout.
    pub dial_timeout: Duration,

    /// TCP keep-alive period on upstream connections.
    pub keep_alive_period: Duration,

    /// TCP user timeout on upstream connections.
    pub tcp_user_timeout: Duration,

    /// Interval between upstream health probes.
    pub health_check_interval: Duration,

    /// Per-probe timeout.
    pub health_check_timeout: Duration,
}

struct Upstream {
    addr: String,
    healthy: AtomicBool,
}

struct State {
    upstreams: RwLock<Vec<Arc<Upstream>>>,
    next: AtomicUsize,
    options: LoadBalancerOptions,
}

/// A running load balancer instance.
pub struct LoadBalancer {
    listen_addr: SocketAddr,
    state: Arc<State>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl LoadBalancer {
    /// Bind and start proxying.
    ///
    /// `upstream_rx` delivers replacement upstream sets; probes mark new
    /// upstreams healthy or not within one health check interval.
    pub async fn start(
        bind: SocketAddr,
        upstreams: Vec<String>,
        mut upstream_rx: mpsc::Receiver<Vec<String>>,
        options: LoadBalancerOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let listen_addr = listener.local_addr()?;

        let state = Arc::new(State {
            upstreams: RwLock::new(to_upstreams(upstreams)),
            next: AtomicUsize::new(0),
            options,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        info!(listen = %listen_addr, "load balancer started");

        tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(health_loop(
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn({
            let state = Arc::clone(&state);
            let mut shutdown_rx = shutdown_rx;

            async move {
                loop {
                    tokio::select! {
                        set = upstream_rx.recv() => {
                            let Some(set) = set else {
                                return;
                            };

                            debug!(upstreams = set.len(), "upstream set replaced");
                            *state.upstreams.write().await = to_upstreams(set);
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }));

        Ok(Self {
            listen_addr,
            state,
            shutdown_tx,
            tasks,
        })
    }

    /// Actual bound address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// True while any upstream probes healthy.
    pub fn healthy(&self) -> bool {
        self.state
            .upstreams
            .try_read()
            .map(|upstreams| {
                upstreams
                    .iter()
                    .any(|u| u.healthy.load(Ordering::Relaxed))
            })
            .unwrap_or(false)
    }

    /// Stop accepting, drop upstream connections, release the port.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            let _ = task.await;
        }

        info!(listen = %self.listen_addr, "load balancer stopped");
    }
}

fn to_upstreams(addrs: Vec<String>) -> Vec<Arc<Upstream>> {
    addrs
        .into_iter()
        .map(|addr| {
            Arc::new(Upstream {
                addr,
                healthy: AtomicBool::new(false),
            })
        })
        .collect()
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((downstream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        tokio::spawn(proxy(downstream, Arc::clone(&state)));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn proxy(mut downstream: TcpStream, state: Arc<State>) {
    let Some(upstream_addr) = pick_upstream(&state).await else {
        debug!("no healthy upstream, dropping connection");
        return;
    };

    let dial = tokio::time::timeout(
        state.options.dial_timeout,
        TcpStream::connect(&upstream_addr),
    )
    .await;

    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(upstream = %upstream_addr, error = %e, "upstream dial failed");
            return;
        }
        Err(_) => {
            warn!(upstream = %upstream_addr, "upstream dial timed out");
            return;
        }
    };

    if let Err(e) = tune_upstream_socket(&upstream, &state.options) {
        debug!(upstream = %upstream_addr, error = %e, "socket tuning failed");
    }

    let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
}

/// Round-robin over healthy upstreams.
async fn pick_upstream(state: &State) -> Option<String> {
    let upstreams = state.upstreams.read().await;

    if upstreams.is_empty() {
        return None;
    }

    let start = state.next.fetch_add(1, Ordering::Relaxed);

    for offset in 0..upstreams.len() {
        let upstream = &upstreams[(start + offset) % upstreams.len()];

        if upstream.healthy.load(Ordering::Relaxed) {
            return Some(upstream.addr.clone());
        }
    }

    None
}

async fn health_loop(state: Arc<State>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.options.health_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let upstreams = state.upstreams.read().await.clone();

        for upstream in upstreams {
            let was_healthy = upstream.healthy.load(Ordering::Relaxed);

            let probe = tokio::time::timeout(
                state.options.health_check_timeout,
                TcpStream::connect(&upstream.addr),
            )
            .await;

            let healthy = matches!(probe, Ok(Ok(_)));
            upstream.healthy.store(healthy, Ordering::Relaxed);

            if healthy != was_healthy {
                info!(upstream = %upstream.addr, healthy, "upstream health changed");
            }
        }
    }
}

/// Keep-alive and user-timeout keep half-dead API servers from wedging
/// long-lived watches.
fn tune_upstream_socket(stream: &TcpStream, options: &LoadBalancerOptions) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    let keep_alive_secs = options.keep_alive_period.as_secs().max(1) as libc::c_int;
    let user_timeout_ms = options.tcp_user_timeout.as_millis() as libc::c_int;

    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, keep_alive_secs)?;
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, keep_alive_secs)?;
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, user_timeout_ms)?;

    Ok(())
}

fn set_sockopt(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn test_options() -> LoadBalancerOptions {
        LoadBalancerOptions {
            dial_timeout: Duration::from_secs(1),
            keep_alive_period: Duration::from_secs(30),
            tcp_user_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_millis(50),
            health_check_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_proxies_to_healthy_upstream() {
        // upstream echoing one fixed byte string
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = upstream.accept().await else {
                    return;
                };

                tokio::spawn(async move {
                    conn.write_all(b"hello from upstream").await.unwrap();
                });
            }
        });

        let (_tx, rx) = mpsc::channel(1);
        let lb = LoadBalancer::start(
            "127.0.0.1:0".parse().unwrap(),
            vec![upstream_addr.to_string()],
            rx,
            test_options(),
        )
        .await
        .unwrap();

        // wait for the first health probe to pass
        for _ in 0..100 {
            if lb.healthy() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(lb.healthy());

        let mut conn = TcpStream::connect(lb.listen_addr()).await.unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from upstream");

        lb.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_unhealthy() {
        let (_tx, rx) = mpsc::channel(1);

        // nothing listens on this port
        let lb = LoadBalancer::start(
            "127.0.0.1:0".parse().unwrap(),
            vec!["127.0.0.1:1".to_string()],
            rx,
            test_options(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!lb.healthy());

        lb.shutdown().await;
    }
}
