use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
};
use uuid::Uuid;

use crate::{dto::content_dto::TryoutView, error::Result, AppState};

#[utoipa::path(
    get,
    path = "/api/tryouts/{id}",
    params(
        ("id" = Uuid, Path, description = "Tryout ID")
    ),
    responses(
        (status = 200, description = "Tryout with its subtests and questions, answer keys stripped", body = Json<TryoutView>),
        (status = 404, description = "Tryout not found")
    )
)]
#[axum::debug_handler]
pub async fn get_tryout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let view = state.content_service.public_view(id).await?;
    Ok(Json(view))
}
