use axum::{
    extract::{
        multipart::MultipartError, rejection::{JsonRejection, PathRejection}, DefaultBodyLimit,
        FromRequest, FromRequestParts, Multipart, Path, Query, Request, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    api_error,
    auth::{hash_password, verify_credentials, AuthUser, TokenSigner},
    card_service::CardService,
    database::Database,
    errors::{ApiError, ErrorContext},
    file_service::{sanitize_filename, FileService, FileUpload},
    file_storage::StorageBackend,
    models::*,
};

use crate::{log_api_start, log_api_success, log_api_warn};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub card_service: CardService,
    pub file_service: FileService,
    pub tokens: TokenSigner,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageBackend>,
        tokens: TokenSigner,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            card_service: CardService::new(db.clone()),
            file_service: FileService::new(db.clone(), storage),
            db,
            tokens,
            max_upload_bytes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// `Json` body whose rejections are answered with the error envelope.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Path` parameters whose rejections are answered with the error envelope.
pub struct ApiPath<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

type HandlerError = (StatusCode, Json<ApiResponse<()>>);
type HandlerResult<T> = Result<Json<ApiResponse<T>>, HandlerError>;
type CreatedResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), HandlerError>;

#[derive(Debug, Deserialize)]
pub struct CardListParams {
    pub search_term: Option<String>,
    pub partial: Option<String>,
}

impl CardListParams {
    /// `partial` is on for `true` or `1`; anything else means full cards.
    pub fn wants_partial(&self) -> bool {
        matches!(
            self.partial.as_deref().map(str::trim).map(str::to_ascii_lowercase).as_deref(),
            Some("true") | Some("1")
        )
    }
}

// Authentication

pub async fn login(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> HandlerResult<LoginResponse> {
    log_api_start!("login");
    let context = || ErrorContext::new("login", "user").with_id(&request.username);

    let user = state
        .db
        .get_user_by_username(&request.username)
        .await
        .map_err(|e| ApiError::from(e).to_response_with_context(context()))?;

    let stored = user.as_ref().map(|u| u.password.clone());
    let password = request.password.clone();
    let verified =
        tokio::task::spawn_blocking(move || verify_credentials(&password, stored.as_deref()))
            .await
            .map_err(|e| {
                ApiError::DatabaseError(anyhow::anyhow!("password check failed: {}", e))
                    .to_response_with_context(context())
            })?;

    let user = match user {
        Some(user) if verified => user,
        _ => {
            log_api_warn!("login", "invalid credentials");
            return Err(ApiError::Unauthorized("Invalid credentials".to_string())
                .to_response_with_context(context()));
        }
    };

    let access_token = state
        .tokens
        .issue(user.id)
        .map_err(|e| e.to_response_with_context(context()))?;

    log_api_success!("login", format!("user {} signed in", user.id));
    Ok(Json(ApiResponse::success(LoginResponse { access_token, user })))
}

// Card endpoints

pub async fn get_cards(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(params): Query<CardListParams>,
) -> HandlerResult<CardListing> {
    log_api_start!("get_cards");

    let listing = state
        .card_service
        .list_cards(params.search_term.as_deref(), params.wants_partial())
        .await
        .map_err(|e| e.to_response_with_context(ErrorContext::new("get_cards", "card")))?;

    let count = match &listing {
        CardListing::Full(cards) => cards.len(),
        CardListing::Partial(cards) => cards.len(),
    };
    log_api_success!("get_cards", count = count, "cards listed");
    Ok(Json(ApiResponse::success(listing)))
}

pub async fn create_card(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<CreateCardRequest>,
) -> HandlerResult<FullCard> {
    log_api_start!("create_card", card_id = request.card_id);
    let card_id = request.card_id.clone();

    let card = state
        .card_service
        .create_card(auth.user_id, request)
        .await
        .map_err(|e| {
            e.to_response_with_context(ErrorContext::new("create_card", "card").with_id(&card_id))
        })?;

    log_api_success!("create_card", card_id = card.card.id, "card created");
    Ok(Json(ApiResponse::success(card)))
}

pub async fn get_card(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> HandlerResult<FullCard> {
    log_api_start!("get_card", card_id = id);

    let card = state
        .card_service
        .get_full_card(id, auth.user_id)
        .await
        .map_err(|e| {
            e.to_response_with_context(
                ErrorContext::new("get_card", "card").with_id(&id.to_string()),
            )
        })?;

    Ok(Json(ApiResponse::success(card)))
}

pub async fn update_card(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<UpdateCardRequest>,
) -> HandlerResult<FullCard> {
    log_api_start!("update_card", card_id = id);

    let card = state
        .card_service
        .update_card(id, request)
        .await
        .map_err(|e| {
            e.to_response_with_context(
                ErrorContext::new("update_card", "card").with_id(&id.to_string()),
            )
        })?;

    log_api_success!("update_card", card_id = id, "card updated");
    Ok(Json(ApiResponse::success(card)))
}

pub async fn delete_card(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> HandlerResult<MessageResponse> {
    log_api_start!("delete_card", card_id = id);

    state.card_service.delete_card(id).await.map_err(|e| {
        e.to_response_with_context(
            ErrorContext::new("delete_card", "card").with_id(&id.to_string()),
        )
    })?;

    log_api_success!("delete_card", card_id = id, "card deleted");
    Ok(Json(ApiResponse::success(MessageResponse::new(
        "Card successfully deleted",
    ))))
}

// User endpoints

pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> HandlerResult<User> {
    log_api_start!("get_user", user_id = id);

    match state.db.get_user(id).await {
        Ok(Some(user)) => Ok(Json(ApiResponse::success(user))),
        Ok(None) => Err(api_error!(not_found, "get_user", "user", id)),
        Err(e) => Err(ApiError::from(e).to_response_with_context(
            ErrorContext::new("get_user", "user").with_id(&id.to_string()),
        )),
    }
}

pub async fn update_password(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<UpdatePasswordRequest>,
) -> HandlerResult<MessageResponse> {
    log_api_start!("update_password", user_id = id);
    let context = || ErrorContext::new("update_password", "user").with_id(&id.to_string());

    if auth.user_id != id {
        log_api_warn!(
            "update_password",
            user_id = auth.user_id,
            format!("attempted to change the password of user {}", id)
        );
        return Err(ApiError::Forbidden(
            "Cannot change another user's password".to_string(),
        )
        .to_response_with_context(context()));
    }
    if request.password.is_empty() {
        return Err(api_error!(validation, "update_password", "user", "Password must not be empty"));
    }

    let password = request.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|hashed| hashed)
        .map_err(|e| ApiError::DatabaseError(e).to_response_with_context(context()))?;
    let updated = state
        .db
        .update_user_password(id, &hash)
        .await
        .map_err(|e| ApiError::from(e).to_response_with_context(context()))?;
    if !updated {
        return Err(api_error!(not_found, "update_password", "user", id));
    }

    log_api_success!("update_password", format!("password updated for user {}", id));
    Ok(Json(ApiResponse::success(MessageResponse::new("success"))))
}

// Category endpoints

pub async fn get_user_categories(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(user_id): ApiPath<i64>,
) -> HandlerResult<Vec<Category>> {
    log_api_start!("get_user_categories", user_id = user_id);

    let categories = state
        .db
        .list_active_categories(user_id)
        .await
        .map_err(|e| {
            ApiError::from(e).to_response_with_context(
                ErrorContext::new("get_user_categories", "category").with_id(&user_id.to_string()),
            )
        })?;

    log_api_success!("get_user_categories", count = categories.len(), "categories listed");
    Ok(Json(ApiResponse::success(categories)))
}

pub async fn create_category(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<CreateCategoryRequest>,
) -> CreatedResult<CategoryCreated> {
    log_api_start!("create_category", user_id = auth.user_id);

    if request.name.trim().is_empty() {
        return Err(api_error!(validation, "create_category", "category", "Category name is required"));
    }

    let owner = request.user_id.unwrap_or(auth.user_id);
    if owner != auth.user_id {
        let exists = state.db.get_user(owner).await.map_err(|e| {
            ApiError::from(e)
                .to_response_with_context(ErrorContext::new("create_category", "category"))
        })?;
        if exists.is_none() {
            return Err(api_error!(not_found, "create_category", "user", owner));
        }
    }

    let category_id = state
        .db
        .create_category(owner, &request, auth.user_id)
        .await
        .map_err(|e| {
            ApiError::from(e)
                .to_response_with_context(ErrorContext::new("create_category", "category"))
        })?;

    log_api_success!("create_category", format!("category {} created", category_id));
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CategoryCreated {
            message: "Category created successfully".to_string(),
            category_id,
        })),
    ))
}

pub async fn update_category(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<UpdateCategoryRequest>,
) -> HandlerResult<Category> {
    log_api_start!("update_category");
    let context = || ErrorContext::new("update_category", "category").with_id(&id.to_string());

    if request.name.trim().is_empty() {
        return Err(api_error!(validation, "update_category", "category", "Category name is required"));
    }

    let updated = state
        .db
        .update_category(id, &request, auth.user_id)
        .await
        .map_err(|e| ApiError::from(e).to_response_with_context(context()))?;
    if !updated {
        return Err(api_error!(not_found, "update_category", "category", id));
    }

    let category = state
        .db
        .get_category(id)
        .await
        .map_err(|e| ApiError::from(e).to_response_with_context(context()))?
        .ok_or_else(|| {
            ApiError::NotFound("Category not found".to_string()).to_response_with_context(context())
        })?;

    log_api_success!("update_category", format!("category {} updated", id));
    Ok(Json(ApiResponse::success(category)))
}

// File endpoints

pub async fn upload_file(
    State(state): State<AppState>,
    auth: AuthUser,
    multipart: Multipart,
) -> CreatedResult<FileUploaded> {
    log_api_start!("upload_file", user_id = auth.user_id);
    let context = || ErrorContext::new("upload_file", "file");

    let upload = read_upload(multipart)
        .await
        .map_err(|e| e.to_response_with_context(context()))?;

    let file = state
        .file_service
        .upload(auth.user_id, upload)
        .await
        .map_err(|e| e.to_response_with_context(context()))?;

    log_api_success!("upload_file", file_id = file.file.id, "file uploaded");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(FileUploaded {
            message: "File uploaded successfully".to_string(),
            file,
        })),
    ))
}

/// Pull the `file` and optional `card_pk` fields out of a multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<FileUpload, ApiError> {
    let malformed = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(e.body_text())
        } else {
            ApiError::ValidationError(format!("Malformed multipart body: {}", e))
        }
    };

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut card_pk = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(malformed)?;
                file = Some((name, content_type, data.to_vec()));
            }
            Some("card_pk") => {
                let raw = field.text().await.map_err(malformed)?;
                let raw = raw.trim();
                if !raw.is_empty() && raw != "null" {
                    card_pk = Some(raw.parse::<i64>().map_err(|_| {
                        ApiError::ValidationError(format!("Invalid card_pk '{}'", raw))
                    })?);
                }
            }
            _ => {}
        }
    }

    let (original_name, content_type, data) =
        file.ok_or_else(|| ApiError::ValidationError("No file part".to_string()))?;
    Ok(FileUpload {
        original_name,
        content_type,
        data,
        card_pk,
    })
}

pub async fn get_file(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> HandlerResult<File> {
    log_api_start!("get_file", file_id = id);

    let file = state.file_service.get(id).await.map_err(|e| {
        e.to_response_with_context(ErrorContext::new("get_file", "file").with_id(&id.to_string()))
    })?;
    Ok(Json(ApiResponse::success(file)))
}

pub async fn get_files(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> HandlerResult<Vec<FileWithCard>> {
    log_api_start!("get_files");

    let files = state
        .file_service
        .list()
        .await
        .map_err(|e| e.to_response_with_context(ErrorContext::new("get_files", "file")))?;

    log_api_success!("get_files", count = files.len(), "files listed");
    Ok(Json(ApiResponse::success(files)))
}

pub async fn edit_file(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<Value>,
) -> HandlerResult<File> {
    log_api_start!("edit_file", file_id = id);

    let file = state
        .file_service
        .patch(id, &body, auth.user_id)
        .await
        .map_err(|e| {
            e.to_response_with_context(ErrorContext::new("edit_file", "file").with_id(&id.to_string()))
        })?;

    log_api_success!("edit_file", file_id = id, "file updated");
    Ok(Json(ApiResponse::success(file)))
}

pub async fn delete_file(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> HandlerResult<MessageResponse> {
    log_api_start!("delete_file", file_id = id);

    state
        .file_service
        .soft_delete(id, auth.user_id)
        .await
        .map_err(|e| {
            e.to_response_with_context(
                ErrorContext::new("delete_file", "file").with_id(&id.to_string()),
            )
        })?;

    log_api_success!("delete_file", file_id = id, "file deleted");
    Ok(Json(ApiResponse::success(MessageResponse::new(
        "File successfully deleted",
    ))))
}

pub async fn download_file(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<Response, HandlerError> {
    log_api_start!("download_file", file_id = id);

    let download = state.file_service.download(id).await.map_err(|e| {
        e.to_response_with_context(
            ErrorContext::new("download_file", "file").with_id(&id.to_string()),
        )
    })?;

    let content_type = HeaderValue::from_str(&download.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let attachment_name = sanitize_filename(&download.name).unwrap_or_else(|| "download".to_string());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", attachment_name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.data,
    )
        .into_response())
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/api/login", post(login))
        // Card routes
        .route("/api/cards", get(get_cards).post(create_card))
        .route(
            "/api/cards/:id",
            get(get_card).put(update_card).delete(delete_card),
        )
        // User routes
        .route("/api/users/:id", get(get_user))
        .route("/api/user/:id/password", put(update_password))
        .route("/api/users/:id/categories", get(get_user_categories))
        // Category routes
        .route("/api/categories", post(create_category))
        .route("/api/categories/:id", put(update_category))
        // File routes
        .route("/api/files", get(get_files))
        .route("/api/files/upload", post(upload_file))
        .route("/api/files/download/:id", get(download_file))
        .route(
            "/api/files/:id",
            get(get_file).patch(edit_file).delete(delete_file),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
