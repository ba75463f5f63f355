use std::time::Duration;

use actix_web::{web, App, HttpServer};
use clap::Parser;

use rustkv::balancer::{self, Balancer};

#[derive(Parser)]
#[command(name = "rustkv-lb")]
#[command(about = "Weight-aware load balancer")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 3)]
    timeout_sec: u64,

    /// Whether backends support HTTPS
    #[arg(long)]
    https: bool,

    /// Whether to include tracing information into responses
    #[arg(long)]
    trace: bool,

    /// Backends to balance across
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "server1:8080,server2:8080,server3:8080"
    )]
    backends: Vec<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let balancer = Balancer::new(
        &cli.backends,
        Duration::from_secs(cli.timeout_sec),
        cli.https,
        cli.trace,
    )
    .map_err(std::io::Error::other)?;
    let balancer = web::Data::new(balancer);

    balancer::spawn_health_checkers(balancer.clone(), &cli.backends);

    log::info!("starting load balancer on {}", cli.port);
    log::info!("tracing support enabled: {}", cli.trace);
    HttpServer::new(move || {
        App::new()
            .app_data(balancer.clone())
            .default_service(web::to(balancer::forward))
    })
    .bind(("0.0.0.0", cli.port))?
    .run()
    .await
}
