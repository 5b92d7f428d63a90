use std::{any::Any, env, fmt, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use utoipa::{Modify, OpenApi};

use vintage_db::{
    images::DEFAULT_LOCATOR_PREFIX, Database, FsObjectStorage, ImageStore, ObjectStorage,
    ProductDraft, ProductFilter, ProductStore, S3ObjectStorage, StoreError,
};

use crate::auth::{require_admin, AdminAuth};
use crate::models::{
    CreatedEnvelope, ErrorBody, ImageListEnvelope, ImageResponse, PrimaryEnvelope, ProductEnvelope,
    ProductListEnvelope, ProductListQuery, ProductResponse, SuccessEnvelope, UploadEnvelope,
};

/// Upper bound on any request body. Leaves room for multipart framing around
/// the largest accepted image.
pub const MAX_REQUEST_BYTES: usize = 30 * 1024 * 1024;

const DEFAULT_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DATABASE_URL: &str = "sqlite://vintage.db";
const DEFAULT_STORAGE_DIR: &str = "./data/images";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;
    let storage = config.storage.connect().await;

    let state = Arc::new(AppState::new(
        ProductStore::new(db.clone()),
        ImageStore::new(db, storage).with_locator_prefix(config.image_url_prefix.clone()),
        AdminAuth::new(&config.admin_password),
    ));
    let app = build_app(state, &config.cors_origin)?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        storage = config.storage.name(),
        "vintage-admin listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(error) => {
            warn!(%error, "failed to install shutdown handler");
            std::future::pending::<()>().await;
        }
    }
}

/// Router plus the outer layers: request tracing, CORS and panic recovery.
pub fn build_app(state: Arc<AppState>, cors_origin: &str) -> Result<Router> {
    Ok(build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origin)?)
        .layer(CatchPanicLayer::custom(panic_response)))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/images/*key", get(serve_image))
        .route("/api/products", get(list_products).post(create_product))
        .route(
            "/api/products/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route(
            "/api/products/:id/images",
            get(list_images).post(upload_image),
        )
        .route(
            "/api/products/:id/images/:image_id/primary",
            put(set_primary_image),
        )
        .route("/api/images/:id", delete(delete_image))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_admin,
        ))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

#[derive(Clone, Debug)]
pub struct AppState {
    products: ProductStore,
    images: ImageStore,
    auth: Arc<AdminAuth>,
}

impl AppState {
    pub fn new(products: ProductStore, images: ImageStore, auth: AdminAuth) -> Self {
        Self {
            products,
            images,
            auth: Arc::new(auth),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Filesystem {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: Option<String>,
    },
}

impl StorageConfig {
    fn name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "fs",
            StorageConfig::S3 { .. } => "s3",
        }
    }

    pub async fn connect(&self) -> Arc<dyn ObjectStorage> {
        match self {
            StorageConfig::Filesystem { root } => Arc::new(FsObjectStorage::new(root.clone())),
            StorageConfig::S3 { bucket, endpoint } => Arc::new(
                S3ObjectStorage::from_env(bucket.clone(), endpoint.as_deref()).await,
            ),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub db_url: String,
    pub admin_password: String,
    pub cors_origin: String,
    pub storage: StorageConfig,
    pub image_url_prefix: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("listen_addr", &self.listen_addr)
            .field("db_url", &self.db_url)
            .field("admin_password", &"<redacted>")
            .field("cors_origin", &self.cors_origin)
            .field("storage", &self.storage)
            .field("image_url_prefix", &self.image_url_prefix)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let listen_addr = var("VINTAGE_API_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
            .parse()
            .context("invalid VINTAGE_API_ADDR")?;

        let db_url = var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let admin_password = lookup("ADMIN_PASSWORD")
            .filter(|value| !value.is_empty())
            .context("ADMIN_PASSWORD must be configured")?;

        let cors_origin = var("CORS_ORIGIN").unwrap_or_else(|| "*".to_string());

        let backend = var("VINTAGE_STORAGE_BACKEND")
            .unwrap_or_else(|| "fs".to_string())
            .to_ascii_lowercase();
        let storage = match backend.as_str() {
            "fs" | "filesystem" => StorageConfig::Filesystem {
                root: var("VINTAGE_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            },
            "s3" => StorageConfig::S3 {
                bucket: var("VINTAGE_S3_BUCKET")
                    .context("VINTAGE_S3_BUCKET must be configured for the s3 backend")?,
                endpoint: var("VINTAGE_S3_ENDPOINT"),
            },
            other => bail!("unknown VINTAGE_STORAGE_BACKEND '{other}' (expected fs or s3)"),
        };

        let image_url_prefix =
            var("VINTAGE_IMAGE_URL_PREFIX").unwrap_or_else(|| DEFAULT_LOCATOR_PREFIX.to_string());

        Ok(Self {
            listen_addr,
            db_url,
            admin_password,
            cors_origin,
            storage,
            image_url_prefix,
        })
    }
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::exact(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid CORS_ORIGIN '{origin}'"))?,
        )
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "Internal Server Error".to_string()
    };
    error!(%message, "request handler panicked");
    ApiError::internal(message).into_response()
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn not_found() -> ApiError {
    ApiError::route_not_found()
}

#[utoipa::path(
    get,
    path = "/api/products",
    params(ProductListQuery),
    responses(
        (status = 200, description = "Products, newest first", body = ProductListEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 500, description = "Listing failed", body = ProductListEnvelope)
    ),
    security(("basicAuth" = []))
)]
async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductListQuery>,
) -> (StatusCode, Json<ProductListEnvelope>) {
    let filter = ProductFilter::from(query);
    match state.products.list(&filter).await {
        Ok(products) => (
            StatusCode::OK,
            Json(ProductListEnvelope {
                success: true,
                products: products.into_iter().map(ProductResponse::from).collect(),
                error: None,
            }),
        ),
        Err(err) => {
            error!(error = %err, ?filter, "listing products failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ProductListEnvelope {
                    success: false,
                    products: Vec::new(),
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/products",
    request_body = ProductDraft,
    responses(
        (status = 201, description = "Product created", body = CreatedEnvelope),
        (status = 400, description = "Validation failed", body = ErrorBody),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn create_product(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ProductDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedEnvelope>), ApiError> {
    let Json(draft) = payload?;
    let id = state.products.create(&draft).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedEnvelope { success: true, id }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/products/{id}",
    params(("id" = i64, Path, description = "Product identifier")),
    responses(
        (status = 200, description = "Product", body = ProductEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 404, description = "Product not found", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn get_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<ProductEnvelope>, ApiError> {
    let id = path_param(path)?;
    let product = state.products.get(id).await?;
    Ok(Json(ProductEnvelope {
        success: true,
        product: product.into(),
    }))
}

#[utoipa::path(
    put,
    path = "/api/products/{id}",
    params(("id" = i64, Path, description = "Product identifier")),
    request_body = ProductDraft,
    responses(
        (status = 200, description = "Product updated", body = SuccessEnvelope),
        (status = 400, description = "Validation failed or nothing to update", body = ErrorBody),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 404, description = "Product not found", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn update_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ProductDraft>, JsonRejection>,
) -> Result<Json<SuccessEnvelope>, ApiError> {
    let id = path_param(path)?;
    let Json(draft) = payload?;
    state.products.update(id, &draft).await?;
    Ok(Json(SuccessEnvelope::ok()))
}

#[utoipa::path(
    delete,
    path = "/api/products/{id}",
    params(("id" = i64, Path, description = "Product identifier")),
    responses(
        (status = 200, description = "Product and its images removed", body = SuccessEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 404, description = "Product not found", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn delete_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<SuccessEnvelope>, ApiError> {
    let id = path_param(path)?;
    let removed = state.products.delete(id).await?;
    for image in &removed {
        discard_referenced_binary(&state.images, &image.url).await;
    }
    Ok(Json(SuccessEnvelope::ok()))
}

#[utoipa::path(
    get,
    path = "/api/products/{id}/images",
    params(("id" = i64, Path, description = "Product identifier")),
    responses(
        (status = 200, description = "Images, primary first", body = ImageListEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn list_images(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<ImageListEnvelope>, ApiError> {
    let product_id = path_param(path)?;
    let images = state.images.list_references(product_id).await?;
    Ok(Json(ImageListEnvelope {
        success: true,
        images: images.into_iter().map(ImageResponse::from).collect(),
    }))
}

struct ImagePart {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// Multipart form with an `image` file field and an optional `isPrimary`
/// field; only the literal `true` marks the image as primary.
#[utoipa::path(
    post,
    path = "/api/products/{id}/images",
    params(("id" = i64, Path, description = "Product identifier")),
    responses(
        (status = 201, description = "Image stored and attached", body = UploadEnvelope),
        (status = 400, description = "No image, disallowed type or too large", body = ErrorBody),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 404, description = "Product not found", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn upload_image(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<UploadEnvelope>), ApiError> {
    let product_id = path_param(path)?;
    let mut multipart = multipart
        .map_err(|rejection| ApiError::failed(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let mut image = None;
    let mut is_primary = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::failed(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::failed(StatusCode::BAD_REQUEST, err.to_string()))?;
                if !bytes.is_empty() {
                    image = Some(ImagePart {
                        filename,
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            "isPrimary" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::failed(StatusCode::BAD_REQUEST, err.to_string()))?;
                is_primary = value == "true";
            }
            _ => {}
        }
    }

    let Some(image) = image else {
        return Err(ApiError::failed(
            StatusCode::BAD_REQUEST,
            "No image provided",
        ));
    };

    let uploaded = state
        .images
        .upload_binary(&image.bytes, &image.filename, &image.content_type)
        .await?;

    let image_id = match state
        .images
        .add_reference(product_id, &uploaded.url, is_primary)
        .await
    {
        Ok(id) => id,
        Err(err) => {
            discard_binary(&state.images, &uploaded.key).await;
            return Err(err.into());
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(UploadEnvelope {
            success: true,
            image_id,
            url: uploaded.url,
            key: uploaded.key,
        }),
    ))
}

#[utoipa::path(
    put,
    path = "/api/products/{id}/images/{image_id}/primary",
    params(
        ("id" = i64, Path, description = "Product identifier"),
        ("image_id" = i64, Path, description = "Image identifier")
    ),
    responses(
        (status = 200, description = "Primary flag moved", body = PrimaryEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn set_primary_image(
    State(state): State<Arc<AppState>>,
    path: Result<Path<(i64, i64)>, PathRejection>,
) -> Result<Json<PrimaryEnvelope>, ApiError> {
    let (product_id, image_id) = path_param(path)?;
    let outcome = state.images.set_primary(product_id, image_id).await?;
    Ok(Json(PrimaryEnvelope {
        success: true,
        promoted: outcome.promoted,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/images/{id}",
    params(("id" = i64, Path, description = "Image identifier")),
    responses(
        (status = 200, description = "Image removed", body = SuccessEnvelope),
        (status = 401, description = "Missing or invalid admin password", body = ErrorBody),
        (status = 404, description = "Image not found", body = ErrorBody)
    ),
    security(("basicAuth" = []))
)]
async fn delete_image(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<SuccessEnvelope>, ApiError> {
    let id = path_param(path)?;
    let image = state.images.delete_reference(id).await?;
    discard_referenced_binary(&state.images, &image.url).await;
    Ok(Json(SuccessEnvelope::ok()))
}

#[utoipa::path(
    get,
    path = "/images/{key}",
    params(("key" = String, Path, description = "Object storage key")),
    responses(
        (status = 200, description = "Image bytes"),
        (status = 404, description = "No such image", body = ErrorBody)
    )
)]
async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ApiError::route_not_found());
    }

    match state.images.fetch_binary(&key).await? {
        Some(object) => Ok((
            [
                (header::CONTENT_TYPE, object.content_type),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=31536000, immutable".to_string(),
                ),
            ],
            object.bytes,
        )
            .into_response()),
        None => Err(ApiError::route_not_found()),
    }
}

/// Binary cleanup after the reference is gone. Failures only leave an orphan
/// object behind, so they are logged and swallowed.
async fn discard_binary(images: &ImageStore, key: &str) {
    if let Err(err) = images.delete_binary(key).await {
        warn!(key, error = %err, "failed to delete image binary");
    }
}

async fn discard_referenced_binary(images: &ImageStore, url: &str) {
    match images.key_for_locator(url) {
        Some(key) => discard_binary(images, key).await,
        None => warn!(url, "image url is outside the storage prefix; binary left in place"),
    }
}

fn path_param<T>(path: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    path.map(|Path(value)| value)
        .map_err(|_| ApiError::route_not_found())
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    store_failure: bool,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            store_failure: false,
        }
    }

    /// An operation failure, reported with `success: false`.
    fn failed(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            store_failure: true,
            ..Self::new(status, message)
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn route_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found")
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::Validation(_)
            | StoreError::NothingToUpdate
            | StoreError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Database(_) | StoreError::CorruptRow(_) | StoreError::Storage(_) => {
                error!(error = ?err, "store operation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::failed(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "api error");
        }
        let body = Json(ErrorBody {
            success: self.store_failure.then_some(false),
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Cose Vintage Admin API", version = "0.1.0"),
        paths(
            healthz,
            list_products,
            create_product,
            get_product,
            update_product,
            delete_product,
            list_images,
            upload_image,
            set_primary_image,
            delete_image,
            serve_image
        ),
        components(schemas(
            ProductDraft,
            ProductResponse,
            ImageResponse,
            ProductListEnvelope,
            ProductEnvelope,
            CreatedEnvelope,
            SuccessEnvelope,
            ImageListEnvelope,
            UploadEnvelope,
            PrimaryEnvelope,
            ErrorBody
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            openapi
                .components
                .get_or_insert_with(Default::default)
                .add_security_scheme(
                    "basicAuth",
                    SecurityScheme::Http(
                        HttpBuilder::new()
                            .scheme(HttpAuthScheme::Basic)
                            .description(Some("Any username; the password is ADMIN_PASSWORD"))
                            .build(),
                    ),
                );
        }
    }
}
