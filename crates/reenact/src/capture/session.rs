//! One recording session: a listening proxy that answers CONNECT with
//! an interception certificate, unwraps the TLS stream, relays each
//! request to the real origin and records the exchange.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::auth::extract_authorization;
use super::exchange::{CapturedExchange, Sampler, Scheme};
use super::filter::SampleFilter;
use super::recorder::{ArtifactSink, ScenarioRecorder};
use super::redirect::{RedirectDecision, RedirectTracker};
use super::CaptureError;
use crate::ca::CertificateAuthority;
use crate::config::CaptureConfig;

/// Shared HTTP client used to reach origins, HTTP/1.1 only.
pub type OriginClient = Client<
    hyper_rustls::HttpsConnector<HttpConnector>,
    BoxBody<Bytes, hyper::Error>,
>;

fn create_origin_client() -> Result<OriginClient, CaptureError> {
    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(30)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(10)));
    http_connector.enforce_http(false);

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https_connector))
}

pub struct RecordingSession {
    id: String,
    port: u16,
    follow_redirects: bool,
    filter: SampleFilter,
    // Exchanges are delivered under this lock, which defines the
    // "previous sample" order the tracker sees.
    tracker: Mutex<RedirectTracker>,
    recorder: ScenarioRecorder,
    ca: Arc<CertificateAuthority>,
    client: OriginClient,
    shutdown_tx: broadcast::Sender<()>,
}

impl RecordingSession {
    pub fn new(
        id: impl Into<String>,
        port: u16,
        config: &CaptureConfig,
        ca: Arc<CertificateAuthority>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Result<Self, CaptureError> {
        let id = id.into();
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(RecordingSession {
            recorder: ScenarioRecorder::new(id.clone(), config.max_samplers_per_artifact, sink),
            id,
            port,
            follow_redirects: config.sampler_follow_redirects,
            filter: SampleFilter::from_config(config),
            tracker: Mutex::new(RedirectTracker::new()),
            ca,
            client: create_origin_client()?,
            shutdown_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn recorder(&self) -> &ScenarioRecorder {
        &self.recorder
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept loop. Runs until `shutdown` is called.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let session = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let session = Arc::clone(&session);
                                    async move { session.handle(req).await }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!("connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error on port {}: {}", self.port, e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("recording session '{}' on port {} shutting down", self.id, self.port);
                    break;
                }
            }
        }
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if req.method() == Method::CONNECT {
            let Some(authority) = req.uri().authority().cloned() else {
                return Ok(status_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires an authority",
                ));
            };
            let host = authority.host().to_string();
            let port = authority.port_u16().unwrap_or(443);

            // Answer 200 first; the TLS unwrap happens on the upgraded
            // stream.
            let session = Arc::clone(&self);
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(e) = session.serve_tls(upgraded, host.clone(), port).await {
                            debug!("tunnel to {}:{} closed: {}", host, port, e);
                        }
                    }
                    Err(e) => {
                        debug!("CONNECT upgrade failed: {}", e);
                    }
                }
            });
            return Ok(Response::new(empty()));
        }

        // Plain HTTP goes through in absolute form.
        let uri = req.uri().clone();
        match (uri.scheme_str(), uri.host()) {
            (Some(scheme), Some(host)) => {
                let scheme = if scheme.eq_ignore_ascii_case("https") {
                    Scheme::Https
                } else {
                    Scheme::Http
                };
                let host = host.to_string();
                let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
                self.relay(req, scheme, host, port).await
            }
            _ => Ok(status_response(
                StatusCode::BAD_REQUEST,
                "expected an absolute request URI",
            )),
        }
    }

    /// Serves the client side of a CONNECT tunnel with an interception
    /// certificate for `host`, then relays each decrypted request.
    async fn serve_tls(
        self: Arc<Self>,
        upgraded: Upgraded,
        host: String,
        port: u16,
    ) -> Result<(), CaptureError> {
        let server_config = self.ca.certificate_for(&host)?;
        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;

        let session = Arc::clone(&self);
        let service = service_fn(move |req| {
            let session = Arc::clone(&session);
            let host = host.clone();
            async move { session.relay(req, Scheme::Https, host, port).await }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(tls_stream), service)
            .await?;
        Ok(())
    }

    /// Forwards one request to the origin and records the exchange.
    /// Origin failures answer 502 and are not recorded.
    async fn relay(
        &self,
        req: Request<Incoming>,
        scheme: Scheme,
        host: String,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("failed to read request body: {}", e);
                return Ok(status_response(
                    StatusCode::BAD_REQUEST,
                    "could not read request body",
                ));
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let origin_uri: hyper::Uri = match format!(
            "{}://{}:{}{}",
            scheme.as_str(),
            host,
            port,
            path_and_query
        )
        .parse()
        {
            Ok(uri) => uri,
            Err(e) => {
                debug!("unparseable origin URI: {}", e);
                return Ok(status_response(
                    StatusCode::BAD_REQUEST,
                    "invalid request URI",
                ));
            }
        };

        let mut origin_req = Request::builder().method(parts.method.clone()).uri(origin_uri);
        for (name, value) in parts.headers.iter() {
            if name == "host" || is_hop_by_hop(name.as_str()) {
                continue;
            }
            origin_req = origin_req.header(name, value);
        }
        let origin_req = match origin_req.body(full(body_bytes.clone())) {
            Ok(request) => request,
            Err(e) => {
                debug!("could not build origin request: {}", e);
                return Ok(status_response(
                    StatusCode::BAD_REQUEST,
                    "invalid request",
                ));
            }
        };

        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                if is_hop_by_hop(name.as_str()) {
                    return None;
                }
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let origin_response = match self.client.request(origin_req).await {
            Ok(response) => response,
            Err(error) => {
                warn!(host = %host, port, %error, "origin request failed");
                return Ok(status_response(
                    StatusCode::BAD_GATEWAY,
                    "origin request failed",
                ));
            }
        };

        let (mut resp_parts, resp_body) = origin_response.into_parts();
        let resp_bytes = match resp_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                warn!(host = %host, port, %error, "could not read origin response");
                return Ok(status_response(
                    StatusCode::BAD_GATEWAY,
                    "could not read origin response",
                ));
            }
        };

        let status = resp_parts.status.as_u16();
        let content_type = resp_parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let location = resp_parts
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query, None),
        };
        let mut exchange = CapturedExchange {
            method: parts.method.to_string(),
            scheme,
            host,
            port,
            path,
            query,
            headers,
            body: (!body_bytes.is_empty()).then(|| body_bytes.to_vec()),
            status,
            content_type,
            redirect_target: None,
        };
        if matches!(status, 301 | 302 | 303 | 307 | 308) {
            if let Some(location) = location {
                exchange.redirect_target = Some(exchange.resolve_location(&location));
            }
        }
        self.deliver(exchange);

        // The body was re-framed from a buffer; the origin's connection
        // management headers no longer apply.
        for name in HOP_BY_HOP {
            resp_parts.headers.remove(*name);
        }
        Ok(Response::from_parts(resp_parts, full(resp_bytes)))
    }

    /// Runs one exchange through the filter, redirect and credential
    /// stages and hands the resulting sampler to the recorder.
    pub(crate) fn deliver(&self, mut exchange: CapturedExchange) {
        if !self.filter.should_capture(&exchange) {
            debug!(url = %exchange.url(), "exchange filtered out");
            return;
        }

        let decision = if self.follow_redirects {
            self.tracker.lock().observe(&exchange)
        } else {
            RedirectDecision::default()
        };

        let url = exchange.url();
        let authorization = extract_authorization(&mut exchange.headers, &url);

        let sampler = Sampler::from_exchange(
            &exchange,
            self.follow_redirects,
            !decision.disable,
            decision.comment.map(str::to_string),
            authorization,
        );
        self.recorder.append(sampler);
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

fn full(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    BoxBody::new(Full::new(bytes).map_err(|never: Infallible| match never {}))
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    full(Bytes::new())
}

fn status_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response
}
