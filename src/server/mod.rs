use std::future::{Future, IntoFuture};
use std::io;
use std::net::{IpAddr, SocketAddr};

use colored::*;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::artifacts::{self, ArtifactProbe};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::{self, CandidateAddr};
use crate::tracker::{DownloadStats, DownloadTracker};
use crate::AppState;

/// A bound artifact server, ready to accept downloads
pub struct ArtifactServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AppState,
}

impl ArtifactServer {
    /// Bind the configured port. An occupied port is reported as
    /// [`ServerError::PortInUse`] and never retried.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let config = config.validated()?;
        let addr = SocketAddr::new(config.bind, config.port);

        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => ServerError::PortInUse { port: config.port },
            _ => ServerError::Bind { addr, source: e },
        })?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            state: AppState::new(config),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    #[cfg(test)]
    pub fn tracker(&self) -> DownloadTracker {
        self.state.tracker.clone()
    }

    /// Print the operator banner: artifact status and the URLs devices can use.
    pub async fn print_banner(&self) {
        let config = self.config();
        let local_addr = self.local_addr();
        let port = local_addr.port();

        println!();
        println!("{}", "Firmware OTA server running".bright_magenta().bold());
        println!();

        match artifacts::probe_artifact(&config.artifact_path).await {
            ArtifactProbe::Ready { size, .. } => {
                println!(
                    "{} Firmware ready: {:.1} KB",
                    "✅".green(),
                    size as f64 / 1024.0
                );
                println!("   {}\n", config.artifact_path.display());
            }
            ArtifactProbe::Missing { .. } => {
                warn!(
                    path = %config.artifact_path.display(),
                    "Firmware not found; serving 404 until it is built"
                );
                println!("{}", "⚠️  WARNING: Firmware not found!".yellow());
                println!("   Expected: {}", config.artifact_path.display());
                println!("   Run {} first\n", "fwdrop prepare".bold());
            }
        }

        let candidates = if local_addr.ip().is_unspecified() {
            net::candidate_addrs()
        } else {
            match local_addr.ip() {
                IpAddr::V4(ip) => vec![CandidateAddr {
                    interface: "bound".to_string(),
                    ip,
                }],
                IpAddr::V6(_) => Vec::new(),
            }
        };

        println!("{}", "📡 Server URLs:".bold());
        if candidates.is_empty() {
            println!("{}", "   No network interfaces found!".yellow());
        }
        for candidate in &candidates {
            let url = candidate.url(port, &config.route);
            info!(interface = %candidate.interface, "serving at {}", url);
            if candidate.is_preferred(config.highlight_prefix.as_deref()) {
                println!(
                    "   {} {}",
                    url.bright_green().bold(),
                    "<-- Use this one!".cyan()
                );
            } else {
                println!("   {}", url);
            }
            println!("   ({})", candidate.interface.dimmed());
        }

        println!("\n{}\n", "Waiting for device connections...".bold());
    }

    /// Serve until `shutdown` resolves, then stop accepting and give
    /// in-flight downloads up to the configured grace period.
    ///
    /// Returns the final download stats.
    pub async fn run_until<F>(self, shutdown: F) -> Result<DownloadStats, ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let tracker = self.state.tracker.clone();
        let grace = self.state.config.shutdown_grace;
        let app = artifacts::routes(&self.state.config.route).with_state(self.state);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let serve = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        })
        .into_future();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result?,
            _ = shutdown => {
                info!(active = tracker.stats().active, "Shutting down OTA server...");
                let _ = stop_tx.send(true);
                match tokio::time::timeout(grace, &mut serve).await {
                    Ok(result) => result?,
                    Err(_) => warn!(
                        active = tracker.stats().active,
                        "Grace period elapsed; dropping in-flight downloads"
                    ),
                }
            }
        }

        let stats = tracker.stats();
        info!(
            total_served = stats.total_served,
            peak_active = stats.peak_active,
            "Server stopped"
        );
        Ok(stats)
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct RunningServer {
        addr: SocketAddr,
        base_url: String,
        tracker: DownloadTracker,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<Result<DownloadStats, ServerError>>,
    }

    impl RunningServer {
        async fn stop(self) -> DownloadStats {
            let _ = self.stop.send(());
            self.handle.await.unwrap().unwrap()
        }
    }

    async fn start_server(artifact: &Path) -> RunningServer {
        let config = ServerConfig {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_grace: Duration::from_millis(200),
            ..ServerConfig::for_artifact(artifact)
        };
        let server = ArtifactServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let base_url = format!("http://{}", addr);
        let tracker = server.tracker();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        RunningServer {
            addr,
            base_url,
            tracker,
            stop,
            handle,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn firmware_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    async fn wait_for_idle(tracker: &DownloadTracker) {
        for _ in 0..500 {
            if tracker.stats().active == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("downloads still active: {:?}", tracker.stats());
    }

    #[tokio::test]
    async fn test_port_in_use_fails_fast() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = ServerConfig {
            port,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        let result = ArtifactServer::bind(config).await;

        match result {
            Err(ServerError::PortInUse { port: p }) => assert_eq!(p, port),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bind should fail while the port is taken"),
        }
    }

    #[tokio::test]
    async fn test_invalid_route_rejected_at_bind() {
        for route in ["/", ":fw.bin", "*", "/ota/*rest"] {
            let config = ServerConfig {
                port: 0,
                bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
                route: route.to_string(),
                ..ServerConfig::default()
            };
            assert!(
                matches!(
                    ArtifactServer::bind(config).await,
                    Err(ServerError::InvalidRoute(_))
                ),
                "{}",
                route
            );
        }
    }

    #[tokio::test]
    async fn test_single_download_one_mebibyte() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("firmware.bin");
        let contents = firmware_bytes(1_048_576);
        std::fs::write(&path, &contents).unwrap();
        let server = start_server(&path).await;

        let response = client()
            .get(format!("{}/firmware.bin", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.content_length(), Some(1_048_576));
        assert_eq!(
            response.headers()["content-type"],
            "application/octet-stream"
        );
        let body = response.bytes().await.unwrap();
        assert_eq!(body.as_ref(), contents.as_slice());

        wait_for_idle(&server.tracker).await;
        let stats = server.stop().await;
        assert_eq!(stats.total_served, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_over_tcp() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = start_server(&dir.path().join("firmware.bin")).await;

        let response = client()
            .get(format!("{}/firmware.bin", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client()
            .get(format!("{}/other.bin", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(response.text().await.unwrap(), "Not Found");

        let stats = server.stop().await;
        assert_eq!(stats.total_served, 0);
    }

    #[tokio::test]
    async fn test_two_concurrent_downloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("firmware.bin");
        // Large enough that neither body fits in the socket buffers
        let contents = firmware_bytes(32 * 1024 * 1024);
        std::fs::write(&path, &contents).unwrap();
        let server = start_server(&path).await;
        let client = client();
        let url = format!("{}/firmware.bin", server.base_url);

        let (first, second) = tokio::join!(client.get(&url).send(), client.get(&url).send());
        let (first, second) = (first.unwrap(), second.unwrap());

        let stats = server.tracker.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total_served, 2);

        let (first, second) = tokio::join!(first.bytes(), second.bytes());
        assert_eq!(first.unwrap().as_ref(), contents.as_slice());
        assert_eq!(second.unwrap().as_ref(), contents.as_slice());

        wait_for_idle(&server.tracker).await;
        let stats = server.stop().await;
        assert_eq!(stats.total_served, 2);
        assert_eq!(stats.peak_active, 2);
    }

    #[tokio::test]
    async fn test_aborted_client_does_not_disturb_others() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("firmware.bin");
        let contents = firmware_bytes(8 * 1024 * 1024);
        std::fs::write(&path, &contents).unwrap();
        let server = start_server(&path).await;
        let client = client();
        let url = format!("{}/firmware.bin", server.base_url);

        let quitter = client.get(&url).send().await.unwrap();
        assert_eq!(quitter.status(), reqwest::StatusCode::OK);

        let downloads: Vec<_> = (0..4)
            .map(|_| {
                let client = client.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    let response = client.get(&url).send().await.unwrap();
                    response.bytes().await.unwrap()
                })
            })
            .collect();

        drop(quitter);

        for download in downloads {
            let body = download.await.unwrap();
            assert_eq!(body.as_ref(), contents.as_slice());
        }

        wait_for_idle(&server.tracker).await;
        let stats = server.stop().await;
        assert_eq!(stats.total_served, 5);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_download_returns() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("firmware.bin");
        std::fs::write(&path, firmware_bytes(32 * 1024 * 1024)).unwrap();
        let server = start_server(&path).await;

        let stalled = client()
            .get(format!("{}/firmware.bin", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(server.tracker.stats().active, 1);

        let addr = server.addr;
        let url = format!("{}/firmware.bin", server.base_url);
        let stats = tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap();
        assert_eq!(stats.total_served, 1);

        // No longer accepting
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert!(client().get(&url).send().await.is_err());
        drop(stalled);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("firmware.bin");
        std::fs::write(&path, b"fw").unwrap();
        let server = start_server(&path).await;
        let addr = server.addr;
        let url = format!("{}/firmware.bin", server.base_url);

        let response = client().get(&url).send().await.unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"fw");

        let stats = server.stop().await;
        assert_eq!(stats.total_served, 1);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert!(client().get(&url).send().await.is_err());
    }
}
