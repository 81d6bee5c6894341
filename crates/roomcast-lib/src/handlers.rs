//! HTTP/WS front controller.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Settings;
use crate::error::{AppError, Envelope};
use crate::hub::{generate_guid, Hub};
use crate::metrics as keys;
use crate::peer::Peer;
use crate::upload::{sniff_image_mime, RoomRateLimiters, UploadStore};
use crate::validation;

const HANDLE_LEN: usize = 8;
const MAX_UPLOAD_FILES: usize = 20;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub cfg: Arc<Settings>,
    pub uploads: Arc<UploadStore>,
    pub upload_limiters: Arc<RoomRateLimiters>,
    handle_format: Arc<Regex>,
}

impl AppState {
    pub fn new(
        hub: Arc<Hub>,
        uploads: Arc<UploadStore>,
        upload_limiters: Arc<RoomRateLimiters>,
    ) -> anyhow::Result<Self> {
        let cfg = hub.settings().clone();
        let handle_format = Arc::new(Regex::new(&cfg.room.peer_handle_format)?);
        Ok(Self {
            hub,
            cfg,
            uploads,
            upload_limiters,
            handle_format,
        })
    }
}

/// Create the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.cfg.upload.max_upload_size as usize;
    Router::new()
        .route("/", get(index))
        .route("/r/{room_id}", get(room_page))
        .route("/ws/{room_id}", get(ws_upgrade))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/{room_id}/login", post(login).delete(logout))
        .route("/api/upload/{room_id}", post(upload))
        .route("/api/uploaded/{file_id}", get(uploaded))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateRoomReq {
    #[serde(default)]
    name: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct CreatedRoom {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LoginReq {
    #[serde(default)]
    handle: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    userpwd: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Serialize)]
struct FileResult {
    id: String,
    err: String,
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(index_page(&state.cfg.server.name))
}

async fn create_room(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let req: CreateRoomReq = read_json(&body)?;
    validation::validate_room_name(&req.name)?;
    validation::validate_room_password(&req.password)?;

    let room = state.hub.add_room(&req.name, &req.password).await?;
    Ok(Json(Envelope::ok(CreatedRoom {
        id: room.id.clone(),
    }))
    .into_response())
}

async fn login(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let room = state.hub.activate_room(&room_id).await?;
    let req: LoginReq = read_json(&body)?;

    let sess_id = if req.token.is_empty() {
        let handle = if req.handle.is_empty() {
            generate_guid(HANDLE_LEN)
        } else {
            req.handle.clone()
        };
        validation::validate_handle(&handle, &state.handle_format)?;
        room.login(&req.password, &handle, &req.userpwd).await?
    } else {
        room.login_with_token(&req.token).await?
    };

    let cookie = format!(
        "{}={}; Path=/r/{}",
        state.cfg.server.session_cookie, sess_id, room.id
    );
    respond_with_cookie(&cookie)
}

async fn logout(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let room = state.hub.activate_room(&room_id).await?;

    if let Some(sess_id) = session_cookie(&headers, &state.cfg.server.session_cookie) {
        state.hub.store().remove_session(&sess_id, &room.id).await?;
    }

    let cookie = format!(
        "{}=; Max-Age=0; Path=/r/{}",
        state.cfg.server.session_cookie, room.id
    );
    respond_with_cookie(&cookie)
}

async fn room_page(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    match state.hub.activate_room(&room_id).await {
        Ok(room) => {
            let mut response = Html(room_shell(&room.name, &room.id)).into_response();
            // The chat page must never come from a cache.
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            );
            response
        }
        Err(_) => (StatusCode::NOT_FOUND, Html(room_not_found_page())).into_response(),
    }
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let room = state.hub.activate_room(&room_id).await?;

    let sess_id =
        session_cookie(&headers, &state.cfg.server.session_cookie).ok_or(AppError::InvalidSession)?;
    let sess = state
        .hub
        .store()
        .get_session(&sess_id, &room.id)
        .await?
        .ok_or(AppError::InvalidSession)?;

    counter!(keys::WS_CONNECTION).increment(1);
    let queue = state.cfg.room.max_message_queue;
    Ok(ws.on_upgrade(move |socket| async move {
        let peer = Peer::new(sess.id, sess.handle, socket, queue);
        room.add_peer(peer).await;
    }))
}

async fn upload(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    if !state.upload_limiters.allow(&room_id) {
        counter!(keys::UPLOADS_RATELIMITED).increment(1);
        return Err(AppError::RateLimited);
    }

    let mut results: HashMap<String, FileResult> = HashMap::new();
    let mut accepted = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(err.to_string()))?
    {
        if !field.name().is_some_and(is_upload_field) {
            continue;
        }
        let filename = field.file_name().unwrap_or("unnamed").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|err| AppError::Validation(err.to_string()))?;

        match sniff_image_mime(&data) {
            Some(mime) => match state.uploads.add(&filename, mime, data) {
                Ok(up) => {
                    counter!(keys::UPLOADS_ACCEPTED).increment(1);
                    results.insert(
                        filename,
                        FileResult {
                            id: format!("{}_{}", up.id, up.name),
                            err: String::new(),
                        },
                    );
                }
                Err(err) => {
                    debug!(%err, "upload rejected by store");
                    results.insert(
                        filename,
                        FileResult {
                            id: String::new(),
                            err: err.to_string(),
                        },
                    );
                }
            },
            None => {
                results.insert(
                    filename,
                    FileResult {
                        id: String::new(),
                        err: "invalid file type".to_string(),
                    },
                );
            }
        }

        accepted += 1;
        if accepted >= MAX_UPLOAD_FILES {
            break;
        }
    }

    Ok(Json(Envelope::ok(results)).into_response())
}

async fn uploaded(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let id = file_id.split('_').next().unwrap_or_default();
    let up = state
        .uploads
        .get(id)
        .ok_or_else(|| AppError::NotFound("file not found".to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(up.mime));
    if state.cfg.upload.max_age > 0 {
        let value = format!("max-age={}", state.cfg.upload.max_age);
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }
    Ok((headers, up.data).into_response())
}

/// Accepted multipart field names: `file0`..`file19`.
fn is_upload_field(name: &str) -> bool {
    name.strip_prefix("file")
        .and_then(|idx| idx.parse::<usize>().ok())
        .is_some_and(|idx| idx < MAX_UPLOAD_FILES)
}

/// Extract the session id from the request's cookies.
fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

fn read_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body)
        .map_err(|_| AppError::Validation("error parsing JSON request".to_string()))
}

fn respond_with_cookie(cookie: &str) -> Result<Response, AppError> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|err| AppError::Internal(format!("invalid cookie value: {err}")))?;
    let mut response = Json(Envelope::ok(true)).into_response();
    response.headers_mut().insert(header::SET_COOKIE, value);
    Ok(response)
}

fn index_page(name: &str) -> String {
    format!(
        "<!doctype html><html><head><title>{name}</title></head>\
         <body><h1>{name}</h1><p>Create a room via POST /api/rooms.</p></body></html>"
    )
}

fn room_shell(name: &str, id: &str) -> String {
    let title = if name.is_empty() { id } else { name };
    format!(
        "<!doctype html><html><head><title>{title}</title></head>\
         <body data-room-id=\"{id}\"><div id=\"app\"></div></body></html>"
    )
}

fn room_not_found_page() -> String {
    "<!doctype html><html><body><h1>Room not found</h1>\
     <p>The room is invalid or has expired.</p></body></html>"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let cfg = Arc::new(Settings::default());
        let store = MemoryStore::new();
        let hub = Hub::new(cfg.clone(), store, None);
        let uploads = UploadStore::new(cfg.upload.clone());
        let limiters = RoomRateLimiters::new(&cfg.upload);
        AppState::new(hub, uploads, limiters).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; roomcast_sess=abc123; theme=dark"),
        );

        assert_eq!(
            session_cookie(&headers, "roomcast_sess").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_cookie(&headers, "missing"), None);

        let empty = HeaderMap::new();
        assert_eq!(session_cookie(&empty, "roomcast_sess"), None);
    }

    #[test]
    fn upload_field_names() {
        assert!(is_upload_field("file0"));
        assert!(is_upload_field("file19"));

        assert!(!is_upload_field("file20"));
        assert!(!is_upload_field("file"));
        assert!(!is_upload_field("attachment0"));
    }

    #[tokio::test]
    async fn create_room_roundtrip() {
        let state = test_state();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/rooms",
                json!({"password": "secret1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["error"].is_null());
        assert_eq!(body["data"]["id"].as_str().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn create_room_validates_password() {
        let state = test_state();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/rooms",
                json!({"password": "short"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("password"));
    }

    #[tokio::test]
    async fn login_sets_scoped_cookie() {
        let state = test_state();
        let room = state.hub.add_room("", "secret1").await.unwrap();
        let app = router(state.clone());

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/rooms/{}/login", room.id),
                json!({"handle": "alice", "password": "secret1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("roomcast_sess="));
        assert!(cookie.ends_with(&format!("; Path=/r/{}", room.id)));

        // The minted session is in the store under this room.
        let sess_id = cookie
            .trim_start_matches("roomcast_sess=")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let sess = state
            .hub
            .store()
            .get_session(&sess_id, &room.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sess.handle, "alice");
    }

    #[tokio::test]
    async fn login_rejects_bad_password() {
        let state = test_state();
        let room = state.hub.add_room("", "secret1").await.unwrap();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/rooms/{}/login", room.id),
                json!({"handle": "alice", "password": "wrong"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"], "incorrect password");
    }

    #[tokio::test]
    async fn login_on_unknown_room_is_bad_request() {
        let state = test_state();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/rooms/zzzzz/login",
                json!({"password": "secret1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "room is invalid or has expired");
    }

    #[tokio::test]
    async fn login_generates_handle_when_missing() {
        let state = test_state();
        let room = state.hub.add_room("", "secret1").await.unwrap();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/rooms/{}/login", room.id),
                json!({"password": "secret1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let state = test_state();
        let room = state.hub.add_room("", "secret1").await.unwrap();
        let sess_id = room.login("secret1", "alice", "").await.unwrap();
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/rooms/{}/login", room.id))
                    .header(
                        header::COOKIE,
                        format!("roomcast_sess={sess_id}"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie.contains("Max-Age=0"));

        assert_eq!(
            state
                .hub
                .store()
                .get_session(&sess_id, &room.id)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn ws_without_session_is_forbidden() {
        let state = test_state();
        let room = state.hub.add_room("", "secret1").await.unwrap();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/ws/{}", room.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn room_page_is_404_for_missing_room() {
        let state = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/r/zzzzz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn uploaded_missing_file_is_404() {
        let state = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/uploaded/nope_missing.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn uploaded_serves_bytes_with_cache_header() {
        let state = test_state();
        let up = state
            .uploads
            .add(
                "dot.gif",
                "image/gif",
                Bytes::from_static(b"GIF89a\x01\x00"),
            )
            .unwrap();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/uploaded/{}_dot.gif", up.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/gif"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "max-age=3600"
        );
    }

    #[tokio::test]
    async fn upload_rate_limit_returns_429() {
        let cfg = {
            let mut cfg = Settings::default();
            cfg.upload.rate_limit_burst = 1;
            Arc::new(cfg)
        };
        let store = MemoryStore::new();
        let hub = Hub::new(cfg.clone(), store, None);
        let uploads = UploadStore::new(cfg.upload.clone());
        let limiters = RoomRateLimiters::new(&cfg.upload);
        let state = AppState::new(hub, uploads, limiters).unwrap();

        // Drain the single token out-of-band; the request must then hit 429.
        assert!(state.upload_limiters.allow("abcde"));
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/upload/abcde")
                    .header(
                        header::CONTENT_TYPE,
                        "multipart/form-data; boundary=xyz",
                    )
                    .body(Body::from("--xyz--\r\n"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
