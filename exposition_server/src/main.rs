//! Exposition Server
//!
//! A small instrumented web service that exposes its own metrics for
//! pull-based scrapers at a well-known path.

mod config;

use anyhow::Result; // alias std::result::Result with dynamic error type
use futures::channel::oneshot;
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tide::{Request, Response, StatusCode};

use exposition_core::encode;
use exposition_core::error::{debug_error, debug_error_enabled, MetricsError};
use exposition_core::registry::{Metric, MetricDescriptor, Registry, Series};
use exposition_core::MetricKind;

use crate::config::Config;

/// The program's main entry point.
fn main() -> Result<()> {
    let (send_shutdown, recv_shutdown) = oneshot::channel::<()>();

    // When we receive a SIGINT (or SIGTERM) signal, begin exiting.
    let signal_once = Cell::new(Some(send_shutdown));
    ctrlc::set_handler(move || {
        // The first time we receive the signal, shutdown gracefully
        if let Some(sender) = signal_once.take() {
            sender.send(()).expect("failed to shutdown");
        }
        // The second time we receive the signal, shutdown immediately
        else {
            std::process::exit(1);
        }
    })?;

    // Start the main event loop
    async_std::task::block_on(run(recv_shutdown))
}

/// The main thread's event loop
async fn run(shutdown: oneshot::Receiver<()>) -> Result<()> {
    // Load configuration from environment variables
    let config = Config::load()?;
    debug_error_enabled(config.debug);

    // The registry lives for the whole process; every exposed series
    // carries the configured static labels.
    let registry = Arc::new(Registry::with_static_labels(config.export_labels.clone()));
    let state = State::new(&registry)?;

    // Every UPTIME_INTERVAL, refresh the process uptime gauge
    let uptime = uptime_series(&registry)?;
    let uptime_task = spawn_uptime_task(uptime, config.uptime_interval);

    // Serve requests until the process is killed
    let addr = format!("{}:{}", config.host, config.port);
    println!("Serving metrics at http://{}{}", addr, config.metrics_path);
    let app = build_app(state, &config.metrics_path);
    let server = async_std::task::spawn(async move {
        if let Err(err) = app.listen(addr).await {
            debug_error(err.into());
        }
    });

    // Shutdown when the process is killed
    shutdown.await?;
    server.cancel().await;
    uptime_task.cancel().await;

    Ok(())
}

/// Shared server state: the registry plus a pre-registered handle for the
/// service's own request counter.
#[derive(Clone)]
struct State {
    registry: Arc<Registry>,
    requests: Arc<Metric>,
}

impl State {
    fn new(registry: &Arc<Registry>) -> Result<State, MetricsError> {
        let requests = registry.get_or_create(MetricDescriptor::new(
            "http_requests_total",
            MetricKind::Counter,
            "Total http requests handled, by method and path.",
            &["method", "path"],
        )?)?;
        Ok(State {
            registry: Arc::clone(registry),
            requests,
        })
    }

    /// Count one handled request.
    fn track(&self, method: &str, path: &str) {
        let counted = self
            .requests
            .with_labels(&[("method", method), ("path", path)])
            .and_then(|series| series.inc(1.0));
        if let Err(err) = counted {
            debug_error(err.into());
        }
    }
}

fn uptime_series(registry: &Registry) -> Result<Arc<Series>, MetricsError> {
    let uptime = registry.get_or_create(MetricDescriptor::new(
        "process_uptime_seconds",
        MetricKind::Gauge,
        "Seconds since the server started.",
        &[],
    )?)?;
    uptime.series()
}

/// A spawnable task that periodically republishes the uptime gauge
fn spawn_uptime_task(uptime: Arc<Series>, interval: Duration) -> async_std::task::JoinHandle<()> {
    async_std::task::spawn(async move {
        let started = Instant::now();
        loop {
            if let Err(err) = uptime.set(started.elapsed().as_secs_f64()) {
                debug_error(err.into());
            }
            async_std::task::sleep(interval).await;
        }
    })
}

/// Build the http app: the demo + probe routes and the exposition endpoint.
fn build_app(state: State, metrics_path: &str) -> tide::Server<State> {
    let mut app = tide::with_state(state);
    app.at("/").get(index);
    app.at("/healthz/live").get(probe);
    app.at("/healthz/ready").get(probe);
    app.at(metrics_path)
        .get(serve_metrics)
        .all(method_not_allowed);
    app
}

/// The demo route of the instrumented service.
async fn index(req: Request<State>) -> tide::Result {
    let method = req.method().to_string();
    req.state().track(&method, req.url().path());
    Ok(Response::builder(StatusCode::Ok)
        .body("Hello! Metrics are served at the exposition endpoint.\n")
        .build())
}

/// Liveness/readiness probe target.
async fn probe(req: Request<State>) -> tide::Result {
    let method = req.method().to_string();
    req.state().track(&method, req.url().path());
    Ok(Response::new(StatusCode::Ok))
}

/// GET on the exposition path: snapshot the registry, encode, respond.
///
/// The body is fully materialized before the network write; no registry
/// lock is held while the response is sent.
async fn serve_metrics(req: Request<State>) -> tide::Result {
    let method = req.method().to_string();
    let state = req.state();
    state.track(&method, req.url().path());

    match encode::render(&state.registry.snapshot()) {
        Ok(body) => Ok(Response::builder(StatusCode::Ok)
            .header("content-type", encode::TEXT_FORMAT)
            .body(body)
            .build()),
        Err(err) => {
            // A failed scrape must never take down the serving process;
            // the scraper retries on its own schedule.
            debug_error(err.into());
            Ok(Response::new(StatusCode::InternalServerError))
        }
    }
}

/// Any verb other than GET on the exposition path.
async fn method_not_allowed(_req: Request<State>) -> tide::Result {
    Ok(Response::new(StatusCode::MethodNotAllowed))
}

#[cfg(test)]
mod test {
    use super::*;
    use tide::http::{Method, Request as HttpRequest, Response as HttpResponse, Url};

    fn test_app() -> tide::Server<State> {
        let registry = Arc::new(Registry::new());
        build_app(State::new(&registry).unwrap(), "/metrics")
    }

    async fn send(app: &tide::Server<State>, method: Method, path: &str) -> HttpResponse {
        let url = Url::parse(&format!("http://localhost{}", path)).unwrap();
        let req = HttpRequest::new(method, url);
        let res: HttpResponse = app.respond(req).await.unwrap();
        res
    }

    #[test]
    fn serves_the_exposition_endpoint() {
        async_std::task::block_on(async {
            let registry = Arc::new(Registry::new());
            let requests = registry
                .get_or_create(
                    MetricDescriptor::new(
                        "requests_total",
                        MetricKind::Counter,
                        "Total requests.",
                        &[],
                    )
                    .unwrap(),
                )
                .unwrap();
            let series = requests.series().unwrap();
            for _ in 0..5 {
                series.inc(1.0).unwrap();
            }

            let app = build_app(State::new(&registry).unwrap(), "/metrics");
            let mut res = send(&app, Method::Get, "/metrics").await;
            assert_eq!(res.status(), StatusCode::Ok);
            assert_eq!(
                res.header("content-type").unwrap().last().as_str(),
                encode::TEXT_FORMAT
            );

            let body = res.body_string().await.unwrap();
            assert!(body.lines().any(|line| line == "requests_total 5"));
        });
    }

    #[test]
    fn counts_its_own_scrapes() {
        async_std::task::block_on(async {
            let app = test_app();
            send(&app, Method::Get, "/metrics").await;
            let mut res = send(&app, Method::Get, "/metrics").await;

            let body = res.body_string().await.unwrap();
            assert!(body
                .lines()
                .any(|line| line == "http_requests_total{method=\"GET\",path=\"/metrics\"} 2"));
        });
    }

    #[test]
    fn rejects_non_get_verbs_on_the_exposition_path() {
        async_std::task::block_on(async {
            let app = test_app();
            for method in &[Method::Post, Method::Put, Method::Delete] {
                let res = send(&app, *method, "/metrics").await;
                assert_eq!(res.status(), StatusCode::MethodNotAllowed);
            }

            // GET still works
            let res = send(&app, Method::Get, "/metrics").await;
            assert_eq!(res.status(), StatusCode::Ok);
        });
    }

    #[test]
    fn answers_health_probes() {
        async_std::task::block_on(async {
            let app = test_app();
            for path in &["/healthz/live", "/healthz/ready"] {
                let res = send(&app, Method::Get, path).await;
                assert_eq!(res.status(), StatusCode::Ok);
            }

            // Probe traffic shows up in the request counter
            let mut res = send(&app, Method::Get, "/metrics").await;
            let body = res.body_string().await.unwrap();
            assert!(body
                .lines()
                .any(|line| line == "http_requests_total{method=\"GET\",path=\"/healthz/live\"} 1"));
        });
    }

    #[test]
    fn exposes_static_labels_on_every_series() {
        async_std::task::block_on(async {
            let labels = vec![("environment".to_string(), "production".to_string())];
            let registry = Arc::new(Registry::with_static_labels(labels));
            let app = build_app(State::new(&registry).unwrap(), "/metrics");

            send(&app, Method::Get, "/").await;
            let mut res = send(&app, Method::Get, "/metrics").await;
            let body = res.body_string().await.unwrap();
            assert!(body.lines().any(|line| line
                == "http_requests_total{environment=\"production\",method=\"GET\",path=\"/\"} 1"));
        });
    }
}
