//! Capture proxy tests over real sockets.
//!
//! A scripted origin answers on a loopback port; requests go through a
//! live recording session, once in plain absolute-form HTTP and once
//! through a CONNECT tunnel against the session's minted certificate.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use reenact::ca::CertificateAuthority;
use reenact::capture::{
    ArtifactSink, CaptureError, CaptureService, MemorySink, REDIRECT_CHAIN_START_COMMENT,
    REDIRECT_FOLLOWUP_COMMENT,
};
use reenact::config::{
    CaptureConfig, CaptureOnReplayConfig, KeystoreModeName, PlaybackConfig, PortRange,
    ScriptsConfig,
};
use reenact::playback::{
    ControllerDeps, Experiment, Notifier, PlaybackController, PlaybackEvent,
};
use reenact::replay::{BrowserDriver, DispatchEvent, DriverError, DriverPool};
use reenact::scenario::{FramePath, RecordedStep};
use reenact::scripting::NoOpScriptHost;
use reenact::storage::{
    InMemoryExperimentRepository, InMemoryRecordingRepository, InMemoryScreenshotStore,
    RecordingRepository,
};

/// Disjoint proxy port slices so tests can run in parallel.
fn next_port_range() -> PortRange {
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(47500);
    let start = PORT_COUNTER.fetch_add(4, Ordering::SeqCst);
    PortRange {
        start,
        end: start + 3,
    }
}

fn capture_service(
    dir: &std::path::Path,
    sink: Arc<MemorySink>,
    max_per_artifact: usize,
) -> CaptureService {
    let mut config = CaptureConfig::default();
    config.port_range = next_port_range();
    config.max_samplers_per_artifact = max_per_artifact;
    config.keystore.mode = KeystoreModeName::DynamicPerHost;
    config.keystore.path = dir.join("keys.json");
    let ca = Arc::new(CertificateAuthority::open(&config.keystore).unwrap());
    CaptureService::new(config, ca, sink as Arc<dyn ArtifactSink>)
}

/// Minimal HTTP origin on an ephemeral port: `/redirect` answers 302
/// towards `/landed`, everything else answers 200 "ok".
async fn spawn_origin() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                while read < buf.len() {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) => return,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read]);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = if path == "/redirect" {
                    format!(
                        "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{port}/landed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    )
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                        .to_string()
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

async fn read_until_close<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// One absolute-form GET through the proxy, as a browser configured
/// with an HTTP proxy would send it.
async fn proxy_get(proxy_port: u16, origin_port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{origin_port}{path} HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nAccept: text/html\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    read_until_close(&mut stream).await
}

// =============================================================================
// Plain HTTP relay
// =============================================================================

#[tokio::test]
async fn test_absolute_form_relay_records_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let service = capture_service(dir.path(), Arc::clone(&sink), 2);
    let origin = spawn_origin().await;

    let proxy = service.start("rec-1").await.unwrap();
    for i in 0..3 {
        let response = proxy_get(proxy, origin, &format!("/page{i}")).await;
        assert!(
            response.starts_with("HTTP/1.1 200"),
            "unexpected response: {response}"
        );
        assert!(response.ends_with("ok"));
    }

    let accepted = service.stop("rec-1").unwrap();
    assert_eq!(accepted, 3);

    // Three samplers with a maximum of two per artifact: 2 + 1.
    let artifacts = sink.artifacts();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].index, 0);
    assert_eq!(artifacts[1].index, 1);
    assert_eq!(artifacts[0].samplers.len(), 2);
    assert_eq!(artifacts[1].samplers.len(), 1);
    assert!(artifacts.iter().all(|a| a.session == "rec-1"));

    let paths: Vec<&str> = artifacts
        .iter()
        .flat_map(|artifact| artifact.samplers.iter().map(|s| s.path.as_str()))
        .collect();
    assert_eq!(paths, vec!["/page0", "/page1", "/page2"]);

    let first = &artifacts[0].samplers[0];
    assert_eq!(first.method, "GET");
    assert_eq!(first.scheme, "http");
    assert_eq!(first.host, "127.0.0.1");
    assert_eq!(first.port, origin);
    assert!(first.enabled);
}

#[tokio::test]
async fn test_wire_redirects_mark_followup_samplers() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let service = capture_service(dir.path(), Arc::clone(&sink), 0);
    let origin = spawn_origin().await;

    let proxy = service.start("rec-1").await.unwrap();
    let response = proxy_get(proxy, origin, "/redirect").await;
    assert!(response.starts_with("HTTP/1.1 302"), "{response}");
    // A browser would follow the Location header; do the same.
    let response = proxy_get(proxy, origin, "/landed").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    service.stop("rec-1").unwrap();

    let artifacts = sink.artifacts();
    assert_eq!(artifacts.len(), 1);
    let samplers = &artifacts[0].samplers;
    assert_eq!(samplers.len(), 2);
    assert_eq!(samplers[0].path, "/redirect");
    assert!(samplers[0].enabled);
    assert_eq!(
        samplers[0].comment.as_deref(),
        Some(REDIRECT_CHAIN_START_COMMENT)
    );
    // The follow-up lands disabled: the sampler for /redirect already
    // follows the hop at load time.
    assert_eq!(samplers[1].path, "/landed");
    assert!(!samplers[1].enabled);
    assert_eq!(
        samplers[1].comment.as_deref(),
        Some(REDIRECT_FOLLOWUP_COMMENT)
    );
}

// =============================================================================
// CONNECT interception
// =============================================================================

#[tokio::test]
async fn test_connect_tunnel_serves_a_trusted_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let service = capture_service(dir.path(), Arc::clone(&sink), 0);

    let proxy = service.start("rec-1").await.unwrap();
    let root_pem = service.root_certificate_pem().unwrap();

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    // Tunnel towards an origin that refuses connections; the handshake
    // and the 502 prove the interception happened inside the tunnel.
    let mut stream = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        header.push(byte[0]);
    }
    let header = String::from_utf8_lossy(&header).to_string();
    assert!(
        header.starts_with("HTTP/1.1 200"),
        "unexpected CONNECT response: {header}"
    );

    // The client only trusts the session's root, so a completed
    // handshake means the minted leaf chained up to it.
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();
    tls.write_all(b"GET /private HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_until_close(&mut tls).await;
    assert!(
        response.starts_with("HTTP/1.1 502"),
        "unexpected tunnel response: {response}"
    );

    // Failed origin requests are never recorded.
    service.stop("rec-1").unwrap();
    assert!(sink.artifacts().is_empty());
}

// =============================================================================
// Capture on replay
// =============================================================================

/// Driver that parks each dispatch on a gate.
struct HoldDriver {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl BrowserDriver for HoldDriver {
    async fn open(&self, _url: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn wait_settled(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn switch_frames(&self, _path: &FramePath) -> Result<(), DriverError> {
        Ok(())
    }

    async fn dispatch(&self, _event: &DispatchEvent) -> Result<(), DriverError> {
        self.gate.acquire().await.expect("gate closed").forget();
        Ok(())
    }

    async fn eval_in_page(&self, _script: &str) -> Result<Value, DriverError> {
        Ok(Value::Null)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![1])
    }
}

struct HoldPool {
    driver: Arc<HoldDriver>,
}

#[async_trait]
impl DriverPool for HoldPool {
    async fn acquire(&self, _experiment: Uuid) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::clone(&self.driver) as Arc<dyn BrowserDriver>)
    }

    async fn release(&self, _experiment: Uuid, _driver: Arc<dyn BrowserDriver>) {}

    async fn discard(&self, _experiment: Uuid) {}
}

struct ChannelNotifier {
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Notifier for ChannelNotifier {
    fn notify(&self, _experiment: &Experiment, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

#[tokio::test]
async fn test_companion_capture_follows_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let service = Arc::new(capture_service(dir.path(), Arc::clone(&sink), 0));

    let gate = Arc::new(Semaphore::new(0));
    let driver = Arc::new(HoldDriver {
        gate: Arc::clone(&gate),
    });
    let recordings = Arc::new(InMemoryRecordingRepository::new());
    let step: RecordedStep = serde_json::from_value(serde_json::json!({
        "type": "click",
        "eventId": 1,
        "url": "https://shop.example.test/",
        "target": [{"getText": "#go"}],
    }))
    .unwrap();
    recordings.put("journey", vec![step]);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let playback = PlaybackConfig {
        capture_on_replay: CaptureOnReplayConfig { enabled: true },
        ..PlaybackConfig::default()
    };
    let deps = ControllerDeps {
        recordings,
        experiments: Arc::new(InMemoryExperimentRepository::new()),
        screenshots: Arc::new(InMemoryScreenshotStore::new()),
        driver_pool: Arc::new(HoldPool { driver }),
        script_host: Arc::new(NoOpScriptHost),
        notifier: Arc::new(ChannelNotifier { events: event_tx }),
        capture: Some(Arc::clone(&service)),
    };
    let controller = PlaybackController::new(playback, ScriptsConfig::default(), deps);

    let experiment = controller.start("journey", false, false).await.unwrap();
    let id = experiment.id.to_string();
    // The companion session came up with the run and holds a port.
    assert!(service.is_active(&id));
    assert!(service.port_of(&id).is_some());

    gate.add_permits(1);
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .expect("timed out waiting for completion")
        .expect("notifier channel closed");
    assert_eq!(event, PlaybackEvent::Done);

    // The controller already stopped the companion session.
    assert!(!service.is_active(&id));
    assert!(matches!(
        service.stop(&id),
        Err(CaptureError::SessionNotFound(_))
    ));
}
