use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use breakwater::config::{ClientConfig, parse_duration};
use breakwater::events::{Event, EventKind};
use breakwater::{Client, OutboundRequest};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::Rng;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "breakwater", about = "Resilient outbound HTTP client demo")]
struct Cli {
    /// Path to TOML config file with client settings
    #[arg(long)]
    config: Option<String>,

    /// Target URL. When omitted, a flaky demo upstream is started locally.
    #[arg(long)]
    url: Option<String>,

    /// Total number of requests to issue
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Number of concurrent request loops
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Failure probability of the built-in demo upstream (0.0-1.0)
    #[arg(long, default_value_t = 0.5)]
    fail_rate: f64,

    /// Response latency of the built-in demo upstream (e.g. "50ms")
    #[arg(long, default_value = "20ms")]
    upstream_latency: String,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("breakwater=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = if let Some(ref path) = cli.config {
        ClientConfig::from_toml_file(path)?
    } else {
        ClientConfig::default()
    };

    let url: http::Uri = match cli.url {
        Some(ref url) => url.parse()?,
        None => {
            let latency = parse_duration(&cli.upstream_latency)
                .map_err(|e| anyhow::anyhow!("invalid upstream latency: {e}"))?;
            let addr = start_demo_upstream(cli.fail_rate, latency).await?;
            tracing::info!(%addr, fail_rate = cli.fail_rate, "started demo upstream");
            format!("http://{addr}/").parse()?
        }
    };

    let client = Client::builder()
        .config(config)
        .on_event(EventKind::BreakerState, |event| {
            if let Event::BreakerState { key, from, to } = event {
                tracing::info!(key, %from, %to, "breaker transition");
            }
        })
        .on_any_event(|event| {
            tracing::debug!(name = event.kind().as_str(), ?event, "client event");
        })
        .build()?;

    let mut workers = Vec::new();
    for worker in 0..cli.concurrency {
        let client = client.clone();
        let url = url.clone();
        let count = cli.requests.div_ceil(cli.concurrency);
        workers.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..count {
                match client.request(OutboundRequest::get(url.clone())).await {
                    Ok(resp) if resp.status.is_server_error() => tally.upstream_errors += 1,
                    Ok(_) => tally.successes += 1,
                    Err(err) => {
                        tracing::debug!(worker, error = %err, "request failed");
                        tally.record_error(err.name());
                    }
                }
            }
            tally
        }));
    }

    let mut total = Tally::default();
    for worker in workers {
        total.merge(worker.await?);
    }

    tracing::info!(
        successes = total.successes,
        upstream_errors = total.upstream_errors,
        circuit_open = total.circuit_open,
        queue_rejections = total.queue_rejections,
        timeouts = total.timeouts,
        transport_errors = total.transport_errors,
        "load complete"
    );

    let snapshot = client.snapshot();
    tracing::info!(
        in_flight = snapshot.in_flight,
        queue_depth = snapshot.queue_depth,
        "limiter state"
    );
    for breaker in snapshot.breakers {
        tracing::info!(
            key = breaker.key,
            state = %breaker.state,
            window_count = breaker.window_count,
            window_failures = breaker.window_failures,
            "breaker state"
        );
    }

    Ok(())
}

#[derive(Default)]
struct Tally {
    successes: usize,
    upstream_errors: usize,
    circuit_open: usize,
    queue_rejections: usize,
    timeouts: usize,
    transport_errors: usize,
}

impl Tally {
    fn record_error(&mut self, name: &str) {
        match name {
            "CircuitOpen" => self.circuit_open += 1,
            "QueueFull" | "QueueTimeout" => self.queue_rejections += 1,
            "RequestTimeout" => self.timeouts += 1,
            _ => self.transport_errors += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.successes += other.successes;
        self.upstream_errors += other.upstream_errors;
        self.circuit_open += other.circuit_open;
        self.queue_rejections += other.queue_rejections;
        self.timeouts += other.timeouts;
        self.transport_errors += other.transport_errors;
    }
}

/// Local upstream that fails a configurable fraction of requests with a 500
/// after a fixed latency. Gives the breaker something to chew on without an
/// external dependency.
async fn start_demo_upstream(fail_rate: f64, latency: Duration) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req| async move {
                    tokio::time::sleep(latency).await;
                    let failed = rand::rng().random::<f64>() < fail_rate;
                    let (status, body) = if failed {
                        (StatusCode::INTERNAL_SERVER_ERROR, "upstream on fire")
                    } else {
                        (StatusCode::OK, "ok")
                    };
                    let resp = Response::builder()
                        .status(status)
                        .body(Full::new(Bytes::from_static(body.as_bytes())));
                    Ok::<_, Infallible>(resp.expect("static response"))
                });
                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(error = %e, "demo upstream connection error");
                }
            });
        }
    });

    Ok(addr)
}
