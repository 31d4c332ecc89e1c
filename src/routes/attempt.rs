use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    Extension,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::attempt_dto::{
        AttemptStateResponse, AttemptView, SaveProgressBatchRequest, SaveProgressBatchResponse,
        SaveProgressRequest, SubmitAttemptRequest, SubmitAttemptResponse, UpdatePlanRequest,
    },
    error::{Error, Result},
    middleware::auth::CurrentUser,
    utils, AppState,
};

#[utoipa::path(
    post,
    path = "/api/tryouts/{tryout_id}/attempts",
    params(
        ("tryout_id" = Uuid, Path, description = "Tryout ID")
    ),
    responses(
        (status = 200, description = "Attempt started or resumed", body = Json<AttemptStateResponse>),
        (status = 403, description = "Tryout is outside its scheduled window")
    )
)]
#[axum::debug_handler]
pub async fn start_attempt(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(tryout_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let response = state
        .attempt_service
        .start_attempt(user_id, tryout_id, utils::time::now())
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/tryouts/{tryout_id}/attempt",
    params(
        ("tryout_id" = Uuid, Path, description = "Tryout ID")
    ),
    responses(
        (status = 200, description = "Latest attempt for the caller", body = Json<AttemptStateResponse>),
        (status = 404, description = "No attempt on this tryout yet")
    )
)]
#[axum::debug_handler]
pub async fn get_attempt(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(tryout_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let response = state
        .attempt_service
        .get_attempt(user_id, tryout_id, utils::time::now())
        .await?
        .ok_or_else(|| Error::NotFound("No attempt on this tryout yet".to_string()))?;
    Ok(Json(response))
}

#[utoipa::path(
    patch,
    path = "/api/attempts/{id}/progress",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = SaveProgressRequest,
    responses(
        (status = 200, description = "Progress saved", body = Json<AttemptStateResponse>),
        (status = 403, description = "Tryout closed or attempt owned by someone else"),
        (status = 409, description = "Attempt is no longer running")
    )
)]
#[axum::debug_handler]
pub async fn save_progress(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SaveProgressRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let response = state
        .attempt_service
        .save_progress(user_id, id, payload, utils::time::now())
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/attempts/{id}/progress/batch",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = SaveProgressBatchRequest,
    responses(
        (status = 200, description = "Batch applied (or recognized as a duplicate)", body = Json<SaveProgressBatchResponse>),
        (status = 409, description = "Attempt is no longer running")
    )
)]
#[axum::debug_handler]
pub async fn save_progress_batch(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SaveProgressBatchRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let response = state
        .attempt_service
        .save_progress_batch(user_id, id, payload, utils::time::now())
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/attempts/{id}/submit",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = SubmitAttemptRequest,
    responses(
        (status = 200, description = "Subtest submitted; score included when the whole attempt is done", body = Json<SubmitAttemptResponse>),
        (status = 409, description = "Subtest deadline has not elapsed yet")
    )
)]
#[axum::debug_handler]
pub async fn submit_attempt(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubmitAttemptRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let response = state
        .attempt_service
        .submit_attempt(user_id, id, payload, utils::time::now())
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    patch,
    path = "/api/attempts/{id}/plan",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = UpdatePlanRequest,
    responses(
        (status = 200, description = "Result plan updated", body = Json<AttemptView>),
        (status = 404, description = "Attempt not found")
    )
)]
#[axum::debug_handler]
pub async fn update_plan(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePlanRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let view = state
        .attempt_service
        .update_plan(user_id, id, payload, utils::time::now())
        .await?;
    Ok(Json(view))
}
