use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::io_struct::{ChatReqInput, ChatResponse, ErrorResponse, ScoreReqInput, ScoreResponse};
use crate::relay::RelayState;
use actix_web::{HttpRequest, HttpResponse, HttpServer, error, get, post, web};

pub const CHAT_FAILURE: &str = "Failed to process request";
pub const SCORE_FAILURE: &str = "Failed to record score";

#[get("/health")]
pub async fn health(_req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[post("/api/chat")]
pub async fn chat(req: web::Json<ChatReqInput>, app_state: web::Data<RelayState>) -> HttpResponse {
    let req = req.into_inner();
    let run_id = req.run_id.clone();

    let result = if req.stream {
        app_state.chat_stream(req).await.map(|body| {
            HttpResponse::Ok()
                .content_type("text/plain; charset=utf-8")
                .streaming(body)
        })
    } else {
        app_state
            .chat(req)
            .await
            .map(|message| HttpResponse::Ok().json(ChatResponse { message }))
    };

    match result {
        Ok(resp) => resp,
        Err(RelayError::InvalidRequest(reason)) => {
            HttpResponse::BadRequest().json(ErrorResponse::new(reason))
        }
        Err(e) => {
            log::error!("Run {} failed: {}", run_id, e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(CHAT_FAILURE))
        }
    }
}

#[post("/api/score")]
pub async fn score(req: web::Json<ScoreReqInput>, app_state: web::Data<RelayState>) -> HttpResponse {
    match app_state.score(&req).await {
        Ok(()) => HttpResponse::Ok().json(ScoreResponse { success: true }),
        Err(e) => {
            log::error!("Failed to score run {}: {}", req.run_id, e);
            HttpResponse::BadGateway().json(ErrorResponse::new(SCORE_FAILURE))
        }
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let body = ErrorResponse::new(err.to_string());
        error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    })
}

/// Register the relay's routes. Callers provide the `web::Data<RelayState>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(health)
        .service(chat)
        .service(score);
}

pub async fn startup(config: RelayConfig, relay_state: RelayState) -> std::io::Result<()> {
    let app_state = web::Data::new(relay_state);

    log::info!("Starting server at {}:{}", config.host, config.port);
    log::info!(
        "Relaying to model {} at temperature {}",
        config.model,
        config.temperature
    );

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .configure(configure)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
