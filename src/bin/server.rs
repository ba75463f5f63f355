use std::path::PathBuf;

use actix_web::{web, App, HttpServer};
use clap::Parser;

use rustkv::gateway::SafeStore;
use rustkv::routes;
use rustkv::store::Db;

#[derive(Parser)]
#[command(name = "rustkv-server")]
#[command(about = "Key-value storage node")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory holding the segment files
    #[arg(long, default_value = "db")]
    dir: PathBuf,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let db = Db::open(&cli.dir).map_err(std::io::Error::other)?;
    let store = web::Data::new(SafeStore::new(db));

    log::info!("storage node listening on {}", cli.port);
    HttpServer::new(move || {
        App::new()
            .app_data(store.clone())
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", cli.port))?
    .run()
    .await
}
