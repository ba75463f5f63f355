pub mod queue;

use std::sync::Mutex;
use std::time::Duration;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};

use self::queue::{PriorityQueue, QueueError};

/// Body served when no backend could take the request. Four bytes, so a
/// failed forward charges the backend a token amount instead of a real
/// transfer.
const FAILURE_BODY: &[u8] = b"down";

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Shared balancer state: the weight queue, one outbound client with the
/// per-request timeout baked in, and the scheme/tracing switches.
///
/// The queue is read by every request handler and written by the health
/// tasks, hence the mutex.
pub struct Balancer {
    pub queue: Mutex<PriorityQueue>,
    pub client: reqwest::Client,
    pub scheme: &'static str,
    pub trace: bool,
}

impl Balancer {
    pub fn new(
        backends: &[String],
        timeout: Duration,
        https: bool,
        trace: bool,
    ) -> Result<Balancer, reqwest::Error> {
        let mut queue = PriorityQueue::new();
        for backend in backends {
            // a fresh pool holds no duplicates, so push cannot fail
            let _ = queue.push(backend, 0);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Balancer {
            queue: Mutex::new(queue),
            client,
            scheme: if https { "https" } else { "http" },
            trace,
        })
    }

    /// Least-loaded backend, if any is alive.
    pub fn pick(&self) -> Result<String, QueueError> {
        self.queue.lock().unwrap().front()
    }

    /// Adds `bytes` served to a backend's cumulative weight. The backend
    /// may have been removed by the health checker mid-request; that is
    /// not worth failing the response over.
    pub fn charge(&self, backend: &str, bytes: i64) {
        let _ = self.queue.lock().unwrap().update(backend, bytes);
    }
}

/// Proxies one request to the least-loaded backend and charges it the
/// number of body bytes that came back.
pub async fn forward(
    request: HttpRequest,
    body: web::Bytes,
    balancer: web::Data<Balancer>,
) -> HttpResponse {
    let backend = match balancer.pick() {
        Ok(backend) => backend,
        Err(_) => {
            log::warn!("no healthy backends");
            return HttpResponse::ServiceUnavailable().body(FAILURE_BODY);
        }
    };

    match proxy(&request, body, &balancer, &backend).await {
        Ok((response, written)) => {
            balancer.charge(&backend, written);
            response
        }
        Err(e) => {
            log::warn!("failed to get response from {}: {}", backend, e);
            balancer.charge(&backend, FAILURE_BODY.len() as i64);
            HttpResponse::ServiceUnavailable().body(FAILURE_BODY)
        }
    }
}

async fn proxy(
    request: &HttpRequest,
    body: web::Bytes,
    balancer: &Balancer,
    backend: &str,
) -> Result<(HttpResponse, i64), reqwest::Error> {
    let url = format!("{}://{}{}", balancer.scheme, backend, request.uri());

    let mut upstream = balancer
        .client
        .request(request.method().clone(), &url)
        .body(body);
    for (name, value) in request.headers() {
        // the client derives Host from the backend url
        if name != header::HOST {
            upstream = upstream.header(name, value.clone());
        }
    }

    let response = upstream.send().await?;
    let status = response.status();

    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers() {
        // actix frames the proxied body itself
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        builder.append_header((name.clone(), value.clone()));
    }
    if balancer.trace {
        builder.insert_header(("lb-from", backend));
    }

    let bytes = response.bytes().await?;
    log::info!("fwd {} {}", status.as_u16(), url);
    let written = bytes.len() as i64;
    Ok((builder.body(bytes), written))
}

/// One probe. Anything but a timely 200 counts as down.
pub async fn health(client: &reqwest::Client, scheme: &str, backend: &str) -> bool {
    let url = format!("{}://{}/health", scheme, backend);
    match client.get(&url).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}

/// Applies one probe result to the pool: drop an unhealthy backend,
/// re-admit a recovered one with a clean slate.
pub fn reconcile(queue: &Mutex<PriorityQueue>, backend: &str, healthy: bool) {
    let mut queue = queue.lock().unwrap();
    if !healthy {
        let _ = queue.remove(backend);
    } else if !queue.exists(backend) {
        let _ = queue.push(backend, 0);
    }
}

/// Spawns the periodic health loop, one task per backend.
pub fn spawn_health_checkers(balancer: web::Data<Balancer>, backends: &[String]) {
    for backend in backends {
        let balancer = balancer.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + HEALTH_INTERVAL;
            let mut ticks = tokio::time::interval_at(start, HEALTH_INTERVAL);
            loop {
                ticks.tick().await;
                let healthy = health(&balancer.client, balancer.scheme, &backend).await;
                log::info!("{} healthy: {}", backend, healthy);
                reconcile(&balancer.queue, &backend, healthy);
            }
        });
    }
}
