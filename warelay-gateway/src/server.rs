use std::sync::Arc;

use axum::extract::{Json as JsonExtract, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::credentials::{CredentialStore, StoreError, Tenant};
use crate::dispatch::Responder;
use crate::registry::{ConnectionStatus, SessionRegistry};

/// Renders an opaque QR payload into the string returned to the client
/// (the app renders a PNG data URI; tests use an identity renderer).
pub trait QrRenderer: Send + Sync {
    fn render(&self, payload: &str) -> anyhow::Result<String>;
}

/// Shared state accessible by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub store: Arc<dyn CredentialStore>,
    pub responder: Arc<dyn Responder>,
    pub qr_renderer: Arc<dyn QrRenderer>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate-qr", get(generate_qr_handler))
        .route("/crear-usuario", post(crear_usuario_handler))
        .route("/status", get(status_handler))
        .route("/preguntar-ia", post(preguntar_ia_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request/response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct CredentialsQuery {
    #[serde(default)]
    text1: String,
    #[serde(default)]
    text2: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateUserPayload {
    usuario: Option<String>,
    #[serde(rename = "contraseña")]
    secret: Option<String>,
    contexto: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AskPayload {
    pregunta: Option<String>,
    #[serde(default)]
    contexto: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    active_sessions: usize,
}

fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

/// Health check endpoint — returns 200 OK with readiness JSON.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "warelay-gateway",
        active_sessions: state.registry.active_sessions().await,
    })
}

/// QR polling endpoint. Repeated calls are cheap: only the first one for a
/// tenant starts a session; later ones observe its current state.
///
/// Responses are plain text: `CONECTADO`, a rendered QR string, or a 503
/// "not yet" that the polling client retries on.
async fn generate_qr_handler(
    State(state): State<AppState>,
    Query(creds): Query<CredentialsQuery>,
) -> impl IntoResponse {
    let Some(tenant) = authenticate(&state, &creds.text1, &creds.text2).await else {
        return (
            StatusCode::FORBIDDEN,
            "Usuario o contraseña incorrectos".to_string(),
        );
    };

    state.registry.ensure_session(&tenant.id).await;

    if state.registry.status(&tenant.id).await == ConnectionStatus::Connected {
        return (StatusCode::OK, "CONECTADO".to_string());
    }

    if let Some(payload) = state.registry.qr(&tenant.id).await {
        match state.qr_renderer.render(&payload) {
            Ok(rendered) => return (StatusCode::OK, rendered),
            Err(e) => {
                // Treated as not-ready: the payload will be re-rendered on
                // the client's next poll.
                error!(tenant = %tenant.id, error = %e, "QR rendering failed");
            }
        }
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        "QR aún no disponible, espere...".to_string(),
    )
}

async fn crear_usuario_handler(
    State(state): State<AppState>,
    JsonExtract(payload): JsonExtract<CreateUserPayload>,
) -> impl IntoResponse {
    let usuario = payload.usuario.unwrap_or_default();
    let secret = payload.secret.unwrap_or_default();
    if usuario.is_empty() || secret.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "Faltan campos");
    }

    let tenant = Tenant {
        id: usuario.clone(),
        secret,
        grounding_context: payload.contexto.unwrap_or_default(),
    };

    match state.store.append_tenant(tenant).await {
        Ok(()) => {
            info!(tenant = %usuario, "Tenant registered");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "message": "Usuario creado correctamente",
                })),
            )
        }
        Err(StoreError::DuplicateTenant(_)) => {
            json_error(StatusCode::BAD_REQUEST, "Usuario ya existe")
        }
        Err(StoreError::Persist(e)) => {
            error!(tenant = %usuario, error = %e, "Failed to persist tenant");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error interno al guardar el usuario",
            )
        }
    }
}

/// Connection-status query. Read-only: never starts a session.
async fn status_handler(
    State(state): State<AppState>,
    Query(creds): Query<CredentialsQuery>,
) -> impl IntoResponse {
    let Some(tenant) = authenticate(&state, &creds.text1, &creds.text2).await else {
        return json_error(StatusCode::FORBIDDEN, "Credenciales incorrectas");
    };

    let conectado = state.registry.status(&tenant.id).await == ConnectionStatus::Connected;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "conectado": conectado })),
    )
}

/// Standalone question-answering endpoint. The responder never fails, so
/// the only error path is a missing question.
async fn preguntar_ia_handler(
    State(state): State<AppState>,
    JsonExtract(payload): JsonExtract<AskPayload>,
) -> impl IntoResponse {
    let Some(pregunta) = payload.pregunta.filter(|p| !p.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "Falta la pregunta");
    };

    let respuesta = state.responder.answer(&pregunta, &payload.contexto).await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "respuesta": respuesta })),
    )
}

/// Look up the tenant and verify the presented secret. `None` covers both
/// unknown tenants and bad secrets, so the two are indistinguishable to
/// the caller.
async fn authenticate(state: &AppState, tenant_id: &str, secret: &str) -> Option<Tenant> {
    match state.store.find_tenant(tenant_id).await {
        Some(tenant) if tenant.verify(secret) => Some(tenant),
        Some(_) => {
            warn!(tenant = %tenant_id, "Rejected request with bad secret");
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InboundDispatcher;
    use crate::protocol::TransportEvent;
    use crate::session::{Transport, TransportHandle};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Transport that replays a fixed event script on every open.
    struct MockTransport {
        opens: AtomicUsize,
        script: Vec<TransportEvent>,
    }

    impl MockTransport {
        fn silent() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                script: Vec::new(),
            })
        }

        fn scripted(script: Vec<TransportEvent>) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                script,
            })
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct NoopHandle;

    #[async_trait]
    impl TransportHandle for NoopHandle {
        async fn send(&self, _recipient: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(
            &self,
            _tenant_id: &str,
        ) -> anyhow::Result<(Arc<dyn TransportHandle>, mpsc::Receiver<TransportEvent>)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let script = self.script.clone();
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                // Keep the stream open so the session is not evicted.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
            Ok((Arc::new(NoopHandle), rx))
        }
    }

    /// In-memory credential store with an optional failing persist path.
    struct MockStore {
        tenants: Mutex<Vec<Tenant>>,
        fail_persist: bool,
    }

    impl MockStore {
        fn with_tenants(tenants: Vec<Tenant>) -> Arc<Self> {
            Arc::new(Self {
                tenants: Mutex::new(tenants),
                fail_persist: false,
            })
        }

        fn failing_persist() -> Arc<Self> {
            Arc::new(Self {
                tenants: Mutex::new(Vec::new()),
                fail_persist: true,
            })
        }
    }

    #[async_trait]
    impl CredentialStore for MockStore {
        async fn find_tenant(&self, id: &str) -> Option<Tenant> {
            self.tenants.lock().unwrap().iter().find(|t| t.id == id).cloned()
        }

        async fn append_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
            let mut tenants = self.tenants.lock().unwrap();
            if tenants.iter().any(|t| t.id == tenant.id) {
                return Err(StoreError::DuplicateTenant(tenant.id));
            }
            if self.fail_persist {
                return Err(StoreError::Persist(anyhow::anyhow!("disk full")));
            }
            tenants.push(tenant);
            Ok(())
        }
    }

    struct EchoResponder;

    #[async_trait]
    impl Responder for EchoResponder {
        async fn answer(&self, message: &str, context: &str) -> String {
            format!("eco: {} [{}]", message, context)
        }
    }

    struct IdentityRenderer;

    impl QrRenderer for IdentityRenderer {
        fn render(&self, payload: &str) -> anyhow::Result<String> {
            Ok(format!("data:mock;{}", payload))
        }
    }

    fn alice() -> Tenant {
        Tenant {
            id: "alice".to_string(),
            secret: "s3cret".to_string(),
            grounding_context: "florería".to_string(),
        }
    }

    fn make_state(transport: Arc<MockTransport>, store: Arc<MockStore>) -> AppState {
        let dispatcher = Arc::new(InboundDispatcher::new(
            store.clone(),
            Arc::new(EchoResponder),
            Duration::from_secs(5),
        ));
        AppState {
            registry: SessionRegistry::new(transport, dispatcher),
            store,
            responder: Arc::new(EchoResponder),
            qr_renderer: Arc::new(IdentityRenderer),
        }
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn request_text(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.expect("router response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response bytes");
        (status, String::from_utf8(body.to_vec()).expect("utf8 body"))
    }

    async fn request_json(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, text) = request_text(app, request).await;
        let json: serde_json::Value = serde_json::from_str(&text).expect("response json");
        (status, json)
    }

    /// Poll the router until the response body satisfies `predicate`.
    async fn poll_until(app: &Router, path: &str, predicate: impl Fn(&str) -> bool) -> String {
        for _ in 0..200 {
            let (_, body) = request_text(app.clone(), get_request(path)).await;
            if predicate(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("polled response never matched for {}", path);
    }

    // --- /health ---

    #[tokio::test]
    async fn test_health() {
        let state = make_state(MockTransport::silent(), MockStore::with_tenants(vec![]));
        let app = build_router(state);
        let (status, json) = request_json(app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_sessions"], 0);
    }

    // --- /crear-usuario ---

    #[tokio::test]
    async fn test_create_user_then_duplicate() {
        let state = make_state(MockTransport::silent(), MockStore::with_tenants(vec![]));
        let app = build_router(state);

        let (status, json) = request_json(
            app.clone(),
            post_json(
                "/crear-usuario",
                serde_json::json!({"usuario": "alice", "contraseña": "x"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Usuario creado correctamente");

        let (status, json) = request_json(
            app,
            post_json(
                "/crear-usuario",
                serde_json::json!({"usuario": "alice", "contraseña": "y"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Usuario ya existe");
    }

    #[tokio::test]
    async fn test_create_user_missing_fields() {
        let state = make_state(MockTransport::silent(), MockStore::with_tenants(vec![]));
        let app = build_router(state);

        for body in [
            serde_json::json!({"usuario": "alice"}),
            serde_json::json!({"contraseña": "x"}),
            serde_json::json!({"usuario": "", "contraseña": "x"}),
            serde_json::json!({}),
        ] {
            let (status, json) =
                request_json(app.clone(), post_json("/crear-usuario", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "Faltan campos");
        }
    }

    #[tokio::test]
    async fn test_create_user_persist_failure_is_500() {
        let state = make_state(MockTransport::silent(), MockStore::failing_persist());
        let app = build_router(state.clone());

        let (status, json) = request_json(
            app,
            post_json(
                "/crear-usuario",
                serde_json::json!({"usuario": "alice", "contraseña": "x"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Error interno al guardar el usuario");

        // The failed registration left no in-memory tenant behind.
        assert!(state.store.find_tenant("alice").await.is_none());
    }

    // --- /status ---

    #[tokio::test]
    async fn test_status_wrong_secret_is_403() {
        let state = make_state(
            MockTransport::scripted(vec![TransportEvent::Connected]),
            MockStore::with_tenants(vec![alice()]),
        );
        let app = build_router(state.clone());

        // Connect alice's session first; 403 must not depend on state.
        state.registry.ensure_session("alice").await;
        poll_until(&app, "/status?text1=alice&text2=s3cret", |body| {
            body.contains("true")
        })
        .await;

        let (status, json) =
            request_json(app, get_request("/status?text1=alice&text2=wrong")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"], "Credenciales incorrectas");
    }

    #[tokio::test]
    async fn test_status_does_not_start_sessions() {
        let transport = MockTransport::silent();
        let state = make_state(transport.clone(), MockStore::with_tenants(vec![alice()]));
        let app = build_router(state);

        let (status, json) =
            request_json(app, get_request("/status?text1=alice&text2=s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["conectado"], false);
        assert_eq!(transport.open_count(), 0);
    }

    // --- /generate-qr ---

    #[tokio::test]
    async fn test_generate_qr_bad_credentials() {
        let transport = MockTransport::silent();
        let state = make_state(transport.clone(), MockStore::with_tenants(vec![alice()]));
        let app = build_router(state);

        let (status, body) =
            request_text(app, get_request("/generate-qr?text1=alice&text2=bad")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Usuario o contraseña incorrectos");
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_qr_first_call_503_single_creation() {
        let transport = MockTransport::silent();
        let state = make_state(transport.clone(), MockStore::with_tenants(vec![alice()]));
        let app = build_router(state);
        let path = "/generate-qr?text1=alice&text2=s3cret";

        // Two requests racing in the same tick: one creation attempt.
        let (first, second) = tokio::join!(
            request_text(app.clone(), get_request(path)),
            request_text(app.clone(), get_request(path)),
        );
        assert_eq!(first.0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(second.0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(first.1, "QR aún no disponible, espere...");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_qr_returns_rendered_payload_then_connected() {
        let transport = MockTransport::scripted(vec![TransportEvent::Qr {
            payload: "qr-payload".to_string(),
        }]);
        let state = make_state(transport, MockStore::with_tenants(vec![alice()]));
        let app = build_router(state.clone());
        let path = "/generate-qr?text1=alice&text2=s3cret";

        let body = poll_until(&app, path, |body| body.starts_with("data:")).await;
        assert_eq!(body, "data:mock;qr-payload");

        // Handshake completes: the QR disappears and CONECTADO takes over.
        state
            .registry
            .close_session("alice")
            .await;
        let state2 = make_state(
            MockTransport::scripted(vec![TransportEvent::Connected]),
            MockStore::with_tenants(vec![alice()]),
        );
        let app2 = build_router(state2);
        let body = poll_until(&app2, path, |body| body == "CONECTADO").await;
        assert_eq!(body, "CONECTADO");
    }

    // --- /preguntar-ia ---

    #[tokio::test]
    async fn test_preguntar_ia_requires_question() {
        let state = make_state(MockTransport::silent(), MockStore::with_tenants(vec![]));
        let app = build_router(state);

        let (status, json) = request_json(
            app,
            post_json("/preguntar-ia", serde_json::json!({"contexto": "c"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Falta la pregunta");
    }

    #[tokio::test]
    async fn test_preguntar_ia_answers() {
        let state = make_state(MockTransport::silent(), MockStore::with_tenants(vec![]));
        let app = build_router(state);

        let (status, json) = request_json(
            app,
            post_json(
                "/preguntar-ia",
                serde_json::json!({"pregunta": "¿horario?", "contexto": "tienda"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["respuesta"], "eco: ¿horario? [tienda]");
    }
}
