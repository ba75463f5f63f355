use actix_web::{get, web, HttpResponse, Responder};

use crate::gateway::SafeStore;
use crate::models::{GetResponse, PutRequest};
use crate::store::DbError;

pub const CONF_HEALTH_FAILURE: &str = "CONF_HEALTH_FAILURE";

/// Mounts the storage API onto an actix app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(
        web::resource("/db/{key:.*}")
            .route(web::get().to(get_value))
            .route(web::post().to(put_value))
            .default_service(web::route().to(method_not_allowed)),
    );
}

pub async fn get_value(key: web::Path<String>, store: web::Data<SafeStore>) -> impl Responder {
    let key = key.into_inner();
    if key.is_empty() {
        return HttpResponse::BadRequest().body("Key is required");
    }
    match store.get(key.as_bytes()).await {
        Ok(value) => match String::from_utf8(value) {
            Ok(value) => HttpResponse::Ok().json(GetResponse { key, value }),
            Err(_) => HttpResponse::InternalServerError().body("Value is not valid text"),
        },
        Err(DbError::NotFound) => HttpResponse::NotFound().body("Key not found"),
        Err(e) => {
            log::error!("get {}: {}", key, e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn put_value(
    key: web::Path<String>,
    body: web::Json<PutRequest>,
    store: web::Data<SafeStore>,
) -> impl Responder {
    let key = key.into_inner();
    if key.is_empty() {
        return HttpResponse::BadRequest().body("Key is required");
    }
    match store.put(key.as_bytes(), body.value.as_bytes()).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => {
            log::error!("put {}: {}", key, e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn method_not_allowed() -> impl Responder {
    HttpResponse::MethodNotAllowed().body("Method Not Allowed")
}

#[get("/health")]
pub async fn health() -> impl Responder {
    if std::env::var(CONF_HEALTH_FAILURE).as_deref() == Ok("true") {
        HttpResponse::InternalServerError()
            .content_type("text/plain")
            .body("FAILURE")
    } else {
        HttpResponse::Ok().content_type("text/plain").body("OK")
    }
}
