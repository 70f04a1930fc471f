//! In-process stand-ins for the hosted completion and telemetry APIs.

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use serde_json::{Value, json};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub auth: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    reply: String,
    status: u16,
    reject_scores: bool,
    requests: Mutex<Vec<Recorded>>,
}

fn record(state: &MockState, req: &HttpRequest, header: &str, body: &Value) {
    let auth = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(Recorded {
        auth,
        body: body.clone(),
    });
}

fn spawn<F>(state: web::Data<MockState>, routes: F) -> (String, ServerHandle)
where
    F: Fn(&mut web::ServiceConfig) + Send + Clone + 'static,
{
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(routes.clone())
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .expect("Failed to bind mock server");
    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (format!("http://{}", addr), handle)
}

/// Mock OpenAI `/v1/chat/completions`, replying with a fixed text.
pub struct MockOpenAiServer {
    pub base_url: String,
    state: web::Data<MockState>,
    handle: ServerHandle,
}

impl MockOpenAiServer {
    pub fn start(reply: &str) -> Self {
        Self::start_with_status(reply, 200)
    }

    pub fn start_with_status(reply: &str, status: u16) -> Self {
        let state = web::Data::new(MockState {
            reply: reply.to_string(),
            status,
            ..Default::default()
        });
        let (url, handle) = spawn(state.clone(), |cfg| {
            cfg.route("/v1/chat/completions", web::post().to(mock_chat_completions));
        });
        MockOpenAiServer {
            base_url: format!("{}/v1", url),
            state,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
    }
}

async fn mock_chat_completions(
    req: HttpRequest,
    body: web::Json<Value>,
    state: web::Data<MockState>,
) -> HttpResponse {
    record(&state, &req, "authorization", &body);

    if state.status != 200 {
        let status = actix_web::http::StatusCode::from_u16(state.status)
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
        return HttpResponse::build(status)
            .json(json!({"error": {"message": "You exceeded your current quota"}}));
    }

    let model = body["model"].as_str().unwrap_or("gpt-3.5-turbo").to_string();
    let usage = json!({"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11});

    if body["stream"].as_bool().unwrap_or(false) {
        let mut events = String::new();
        for word in state.reply.split_inclusive(' ') {
            let chunk = json!({
                "id": "chatcmpl-123",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": {"content": word}, "finish_reason": null}]
            });
            events.push_str(&format!("data: {}\n\n", chunk));
        }
        let last = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [],
            "usage": usage
        });
        events.push_str(&format!("data: {}\n\n", last));
        events.push_str("data: [DONE]\n\n");
        return HttpResponse::Ok()
            .content_type("text/event-stream")
            .body(events);
    }

    HttpResponse::Ok().json(json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": state.reply},
            "finish_reason": "stop"
        }],
        "usage": usage
    }))
}

/// Mock telemetry GraphQL endpoint.
pub struct MockLiteralServer {
    pub base_url: String,
    state: web::Data<MockState>,
    handle: ServerHandle,
}

impl MockLiteralServer {
    pub fn start() -> Self {
        Self::start_with(false)
    }

    pub fn rejecting_scores() -> Self {
        Self::start_with(true)
    }

    fn start_with(reject_scores: bool) -> Self {
        let state = web::Data::new(MockState {
            reject_scores,
            ..Default::default()
        });
        let (base_url, handle) = spawn(state.clone(), |cfg| {
            cfg.route("/api/graphql", web::post().to(mock_graphql));
        });
        MockLiteralServer {
            base_url,
            state,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r.body["operationName"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
    }
}

async fn mock_graphql(
    req: HttpRequest,
    body: web::Json<Value>,
    state: web::Data<MockState>,
) -> HttpResponse {
    record(&state, &req, "x-api-key", &body);

    let response = match body["operationName"].as_str().unwrap_or_default() {
        "GetParticipant" => json!({"data": {"participant": null}}),
        "CreateParticipant" => json!({"data": {"createParticipant": {"id": "participant-1"}}}),
        "UpsertThread" => json!({"data": {"upsertThread": {"id": body["variables"]["id"]}}}),
        "IngestSteps" => json!({"data": {"ingestSteps": {"ok": true, "message": ""}}}),
        "CreateScore" if state.reject_scores => {
            json!({"data": null, "errors": [{"message": "step not found"}]})
        }
        "CreateScore" => json!({"data": {"createScore": {"id": "score-1"}}}),
        other => json!({"errors": [{"message": format!("unknown operation {}", other)}]}),
    };
    HttpResponse::Ok().json(response)
}
