use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::Ingredient,
    response::{ApiResponse, Meta},
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct IngredientQuery {
    /// Case-insensitive prefix match on the ingredient name.
    pub name: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(transparent)]
pub struct IngredientList {
    #[schema(value_type = Vec<Ingredient>)]
    pub items: Vec<Ingredient>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_ingredients))
        .route("/{id}", get(get_ingredient))
}

#[utoipa::path(
    get,
    path = "/api/ingredients",
    params(
        ("name" = Option<String>, Query, description = "Name prefix, case-insensitive")
    ),
    responses(
        (status = 200, description = "List ingredients", body = ApiResponse<IngredientList>)
    ),
    tag = "Ingredients"
)]
pub async fn list_ingredients(
    State(state): State<AppState>,
    Query(query): Query<IngredientQuery>,
) -> AppResult<Json<ApiResponse<IngredientList>>> {
    let items = match query.name.as_deref().filter(|name| !name.is_empty()) {
        Some(prefix) => {
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            sqlx::query_as::<_, Ingredient>(
                "SELECT * FROM ingredients WHERE name ILIKE $1 ORDER BY name",
            )
            .bind(pattern)
            .fetch_all(&state.pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Ingredient>("SELECT * FROM ingredients ORDER BY name")
                .fetch_all(&state.pool)
                .await?
        }
    };

    Ok(Json(ApiResponse::success(
        "OK",
        IngredientList { items },
        Some(Meta::empty()),
    )))
}

#[utoipa::path(
    get,
    path = "/api/ingredients/{id}",
    params(
        ("id" = Uuid, Path, description = "Ingredient ID")
    ),
    responses(
        (status = 200, description = "Get ingredient", body = ApiResponse<Ingredient>),
        (status = 404, description = "Ingredient not found")
    ),
    tag = "Ingredients"
)]
pub async fn get_ingredient(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Ingredient>>> {
    let ingredient: Option<Ingredient> = sqlx::query_as("SELECT * FROM ingredients WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;

    let ingredient = ingredient.ok_or(AppError::NotFound)?;
    Ok(Json(ApiResponse::success(
        "OK",
        ingredient,
        Some(Meta::empty()),
    )))
}
