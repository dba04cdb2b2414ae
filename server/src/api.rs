use std::sync::Arc;

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use ota_schema::{is_valid_version, CheckRequest, Heartbeat, OutcomeReport, PatchId};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{extract_token, verify_admin, DeviceAuthenticator};
use crate::chunks::{ChunkError, ChunkServer};
use crate::config::ServerConfig;
use crate::coordinator::UpdateCoordinator;
use crate::generator::{GeneratorError, PatchGenerator};
use crate::patches::{CatalogError, PatchCatalog};
use crate::registry::{FirmwareRegistry, RegistryError};
use crate::store::ArtifactStore;

pub const CBOR: &str = "application/cbor";

/// Upper bound on uploaded firmware images.
const MAX_FIRMWARE_SIZE: usize = 16 * 1024 * 1024;

pub struct State {
    pub registry: Arc<FirmwareRegistry>,
    pub catalog: Arc<PatchCatalog>,
    pub chunks: ChunkServer,
    pub coordinator: UpdateCoordinator,
    devices: DeviceAuthenticator,
    admin_key: String,
}

impl State {
    pub async fn open(
        store: Arc<dyn ArtifactStore>,
        config: &ServerConfig,
        devices: DeviceAuthenticator,
    ) -> Result<Self, CatalogError> {
        let registry = Arc::new(FirmwareRegistry::open(store.clone()).await?);
        let catalog = Arc::new(
            PatchCatalog::open(
                store,
                registry.clone(),
                PatchGenerator::new(config.generator()),
                config.patch_cache_size,
            )
            .await?,
        );
        let coordinator =
            UpdateCoordinator::new(registry.clone(), catalog.clone(), config.coordinator());
        Ok(Self {
            chunks: ChunkServer::new(catalog.clone()),
            registry,
            catalog,
            coordinator,
            devices,
            admin_key: config.admin_key.clone(),
        })
    }

    fn authorize_device(&self, request: &HttpRequest, device_id: &str) -> Result<(), ApiError> {
        match extract_token(request) {
            Some(token) if self.devices.verify(device_id, &token) => Ok(()),
            _ => {
                log::warn!("Rejected request for device {}", device_id);
                Err(ApiError::Unauthorized)
            }
        }
    }

    fn authorize_admin(&self, request: &HttpRequest) -> Result<(), ApiError> {
        match extract_token(request) {
            Some(token) if !self.admin_key.is_empty() && verify_admin(&self.admin_key, &token) => {
                Ok(())
            }
            _ => {
                log::warn!("Rejected admin request to {}", request.path());
                Err(ApiError::Unauthorized)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("encoding response")]
    Encoding(#[from] serde_cbor::Error),
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound(_) | RegistryError::NoCurrentVersion => StatusCode::NOT_FOUND,
        RegistryError::DuplicateVersion(_) => StatusCode::CONFLICT,
        RegistryError::InvalidVersion(_) => StatusCode::BAD_REQUEST,
        RegistryError::MissingBinary(_) | RegistryError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn catalog_status(e: &CatalogError) -> StatusCode {
    match e {
        CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
        CatalogError::Registry(e) => registry_status(e),
        CatalogError::Generator(GeneratorError::DiffTooLarge { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CatalogError::Generator(GeneratorError::SameVersion(_)) => StatusCode::BAD_REQUEST,
        CatalogError::Generator(_)
        | CatalogError::Corrupt(_)
        | CatalogError::Storage(_)
        | CatalogError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => registry_status(e),
            ApiError::Catalog(e) => catalog_status(e),
            ApiError::Chunk(ChunkError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Chunk(ChunkError::OutOfRange { .. }) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Chunk(ChunkError::Catalog(e)) => catalog_status(e),
            ApiError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::warn!("Request failed: {:?}", self);
        }
        HttpResponse::build(status).json(json!({ "error": self.to_string() }))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

/// Registers every route on an app. Handlers expect `web::Data<Arc<State>>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/healthz").route(web::get().to(healthz)))
        .service(
            web::scope("/v1/devices/{device_id}")
                .app_data(web::JsonConfig::default().limit(4096))
                .service(web::resource("/check").route(web::post().to(check)))
                .service(web::resource("/heartbeat").route(web::post().to(heartbeat)))
                .service(web::resource("/outcome").route(web::post().to(outcome)))
                .service(
                    web::resource("/patches/{patch_id}/chunks/{index}")
                        .route(web::get().to(get_chunk)),
                ),
        )
        .service(
            web::scope("/v1/admin")
                .app_data(web::PayloadConfig::new(MAX_FIRMWARE_SIZE))
                .service(web::resource("/firmware").route(web::get().to(list_firmware)))
                .service(web::resource("/firmware/current").route(web::get().to(current_firmware)))
                .service(web::resource("/firmware/{version}").route(web::put().to(put_firmware)))
                .service(web::resource("/patches").route(web::post().to(create_patch)))
                .service(web::resource("/status").route(web::get().to(fleet_status))),
        );
}

async fn healthz() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "OK"
    }))
}

async fn check(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    device_id: web::Path<String>,
    body: web::Json<CheckRequest>,
) -> ApiResult {
    state.authorize_device(&request, &device_id)?;
    if !is_valid_version(&body.current_version) {
        return Err(ApiError::BadRequest(format!(
            "invalid version '{}'",
            body.current_version
        )));
    }
    log::debug!("Device {} checking from {}", device_id, body.current_version);
    let response = state
        .coordinator
        .check(&device_id, &body.current_version)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn get_chunk(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    path: web::Path<(String, String, u32)>,
) -> ApiResult {
    let (device_id, patch_id, index) = path.into_inner();
    state.authorize_device(&request, &device_id)?;
    let patch_id: PatchId = patch_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid patch id '{}'", patch_id)))?;

    let (metadata, chunk) = state.chunks.get_chunk(&patch_id, index).await?;
    state
        .coordinator
        .record_chunk_progress(&device_id, &metadata, index)
        .await;

    if accepts_cbor(&request) {
        let body = serde_cbor::to_vec(&chunk)?;
        Ok(HttpResponse::Ok().content_type(CBOR).body(body))
    } else {
        Ok(HttpResponse::Ok().json(chunk))
    }
}

fn accepts_cbor(request: &HttpRequest) -> bool {
    request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(CBOR))
        .unwrap_or(false)
}

async fn outcome(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    device_id: web::Path<String>,
    body: web::Json<OutcomeReport>,
) -> ApiResult {
    state.authorize_device(&request, &device_id)?;
    let report = body.into_inner();
    state
        .coordinator
        .complete(&device_id, &report.patch_id, report.outcome, report.reason)
        .await;
    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

async fn heartbeat(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    device_id: web::Path<String>,
    body: web::Json<Heartbeat>,
) -> ApiResult {
    state.authorize_device(&request, &device_id)?;
    if !is_valid_version(&body.version) {
        return Err(ApiError::BadRequest(format!("invalid version '{}'", body.version)));
    }
    let response = state.coordinator.heartbeat(&device_id, &body.version).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Deserialize)]
struct RegisterQuery {
    #[serde(default)]
    current: bool,
}

async fn put_firmware(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    version: web::Path<String>,
    query: web::Query<RegisterQuery>,
    body: web::Bytes,
) -> ApiResult {
    state.authorize_admin(&request)?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty firmware image".to_string()));
    }
    let firmware = state
        .registry
        .register(&version, &body, query.current)
        .await?;
    Ok(HttpResponse::Created().json(firmware))
}

async fn list_firmware(state: web::Data<Arc<State>>, request: HttpRequest) -> ApiResult {
    state.authorize_admin(&request)?;
    Ok(HttpResponse::Ok().json(state.registry.list().await))
}

async fn current_firmware(state: web::Data<Arc<State>>, request: HttpRequest) -> ApiResult {
    state.authorize_admin(&request)?;
    Ok(HttpResponse::Ok().json(state.registry.get_current().await?))
}

#[derive(Deserialize)]
struct PatchRequest {
    from: String,
    to: String,
}

async fn create_patch(
    state: web::Data<Arc<State>>,
    request: HttpRequest,
    body: web::Json<PatchRequest>,
) -> ApiResult {
    state.authorize_admin(&request)?;
    let patch = state.catalog.find_or_generate(&body.from, &body.to).await?;
    Ok(HttpResponse::Ok().json(patch))
}

async fn fleet_status(state: web::Data<Arc<State>>, request: HttpRequest) -> ApiResult {
    state.authorize_admin(&request)?;
    Ok(HttpResponse::Ok().json(state.coordinator.fleet_status().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use actix_web::{test, App};
    use ota_schema::{CheckResponse, ChunkResponse, FirmwareVersion, FleetStatus, OtaState};

    const ADMIN: &str = "Bearer admin-key";
    const DEVICE: &str = "Bearer dev-1-token";

    fn image(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    async fn state() -> Arc<State> {
        let config = ServerConfig {
            admin_key: "admin-key".to_string(),
            ..Default::default()
        };
        let devices = DeviceAuthenticator::from_tokens([("dev-1", "dev-1-token")]);
        Arc::new(
            State::open(Arc::new(MemoryStore::new()), &config, devices)
                .await
                .unwrap(),
        )
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn healthz_needs_no_auth() {
        let state = state().await;
        let app = app!(state);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn firmware_upload_and_duplicates() {
        let state = state().await;
        let app = app!(state);

        let req = test::TestRequest::put()
            .uri("/v1/admin/firmware/5.0?current=true")
            .insert_header((header::AUTHORIZATION, ADMIN))
            .set_payload(image(4096, 1))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let firmware: FirmwareVersion = test::read_body_json(resp).await;
        assert!(firmware.is_current);
        assert_eq!(firmware.size, 4096);

        let req = test::TestRequest::put()
            .uri("/v1/admin/firmware/5.0")
            .insert_header((header::AUTHORIZATION, ADMIN))
            .set_payload(image(4096, 2))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::put()
            .uri("/v1/admin/firmware/5.1")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_payload(image(4096, 2))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn device_download_flow() {
        let state = state().await;
        let v50 = image(20_000, 50);
        let mut v53 = v50.clone();
        v53[10_000..10_500].copy_from_slice(&image(500, 53));
        state.registry.register("5.0", &v50, true).await.unwrap();
        state.registry.register("5.3", &v53, true).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/devices/dev-1/check")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_json(&CheckRequest {
                current_version: "5.0".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let check: CheckResponse = test::read_body_json(resp).await;
        let offer = check.offer().unwrap();
        assert_eq!(offer.target_version, "5.3");

        let mut patch = Vec::new();
        for index in 0..offer.chunk_count {
            let req = test::TestRequest::get()
                .uri(&format!(
                    "/v1/devices/dev-1/patches/{}/chunks/{}",
                    offer.patch_id, index
                ))
                .insert_header((header::AUTHORIZATION, DEVICE))
                .insert_header((header::ACCEPT, CBOR))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body = test::read_body(resp).await;
            let chunk: ChunkResponse = serde_cbor::from_slice(&body).unwrap();
            assert!(chunk.is_valid());
            patch.extend_from_slice(&chunk.payload);
        }
        assert_eq!(ota_patch::apply_patch(&v50, &patch).unwrap(), v53);

        let req = test::TestRequest::get()
            .uri(&format!(
                "/v1/devices/dev-1/patches/{}/chunks/{}",
                offer.patch_id, offer.chunk_count
            ))
            .insert_header((header::AUTHORIZATION, DEVICE))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let req = test::TestRequest::post()
            .uri("/v1/devices/dev-1/outcome")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_json(&OutcomeReport {
                patch_id: offer.patch_id.clone(),
                outcome: ota_schema::Outcome::Success,
                reason: None,
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/v1/devices/dev-1/heartbeat")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_json(&Heartbeat {
                version: "5.3".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        let check: CheckResponse = test::read_body_json(resp).await;
        assert!(!check.available);

        let req = test::TestRequest::get()
            .uri("/v1/admin/status")
            .insert_header((header::AUTHORIZATION, ADMIN))
            .to_request();
        let status: FleetStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status.devices.len(), 1);
        assert_eq!(status.devices[0].state, OtaState::Confirmed);
    }

    #[actix_web::test]
    async fn device_token_is_bound_to_its_device() {
        let state = state().await;
        state.registry.register("5.0", b"firmware", true).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/devices/dev-2/check")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_json(&CheckRequest {
                current_version: "5.0".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "unauthorized");
    }

    #[actix_web::test]
    async fn unknown_patch_and_oversized_diff() {
        let config = ServerConfig {
            admin_key: "admin-key".to_string(),
            max_patch_size: 512,
            ..Default::default()
        };
        let state = Arc::new(
            State::open(
                Arc::new(MemoryStore::new()),
                &config,
                DeviceAuthenticator::from_tokens([("dev-1", "dev-1-token")]),
            )
            .await
            .unwrap(),
        );
        state.registry.register("1.0", &image(8_000, 1), true).await.unwrap();
        state.registry.register("2.0", &image(8_000, 2), true).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri("/v1/devices/dev-1/patches/1.0..2.0/chunks/0")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::NOT_FOUND
        );

        let req = test::TestRequest::post()
            .uri("/v1/admin/patches")
            .insert_header((header::AUTHORIZATION, ADMIN))
            .set_json(&json!({ "from": "1.0", "to": "2.0" }))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        // Too large a delta means no offer rather than an error.
        let req = test::TestRequest::post()
            .uri("/v1/devices/dev-1/check")
            .insert_header((header::AUTHORIZATION, DEVICE))
            .set_json(&CheckRequest {
                current_version: "1.0".to_string(),
            })
            .to_request();
        let check: CheckResponse = test::call_and_read_body_json(&app, req).await;
        assert!(!check.available);
    }
}
