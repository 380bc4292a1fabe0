use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::recipes::ShortRecipe,
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    response::{ApiResponse, Meta},
    state::AppState,
};

/// Which (user, recipe) association table a toggle operates on. Favorite
/// and shopping-cart share the exact add/remove contract, so the table
/// identity and messages are the only moving parts.
#[derive(Debug, Clone, Copy)]
pub enum MarkTable {
    Favorites,
    ShoppingCart,
}

impl MarkTable {
    fn table(self) -> &'static str {
        match self {
            MarkTable::Favorites => "favorites",
            MarkTable::ShoppingCart => "shopping_carts",
        }
    }

    fn already_message(self) -> &'static str {
        match self {
            MarkTable::Favorites => "Recipe is already in favorites.",
            MarkTable::ShoppingCart => "Recipe is already in shopping cart.",
        }
    }

    fn missing_message(self) -> &'static str {
        match self {
            MarkTable::Favorites => "Recipe is not in favorites.",
            MarkTable::ShoppingCart => "Recipe is not in shopping cart.",
        }
    }

    fn audit_action(self, added: bool) -> &'static str {
        match (self, added) {
            (MarkTable::Favorites, true) => "favorite_add",
            (MarkTable::Favorites, false) => "favorite_remove",
            (MarkTable::ShoppingCart, true) => "cart_add",
            (MarkTable::ShoppingCart, false) => "cart_remove",
        }
    }
}

async fn fetch_short_recipe(state: &AppState, recipe_id: Uuid) -> AppResult<ShortRecipe> {
    let recipe: Option<ShortRecipe> =
        sqlx::query_as("SELECT id, name, image, cooking_time FROM recipes WHERE id = $1")
            .bind(recipe_id)
            .fetch_optional(&state.pool)
            .await?;
    recipe.ok_or(AppError::NotFound)
}

pub async fn add_mark(
    state: &AppState,
    user: &AuthUser,
    recipe_id: Uuid,
    mark: MarkTable,
) -> AppResult<ApiResponse<ShortRecipe>> {
    let recipe = fetch_short_recipe(state, recipe_id).await?;

    let exists: (bool,) = sqlx::query_as(&format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE user_id = $1 AND recipe_id = $2)",
        mark.table()
    ))
    .bind(user.user_id)
    .bind(recipe_id)
    .fetch_one(&state.pool)
    .await?;

    if exists.0 {
        return Err(AppError::BadRequest(mark.already_message().into()));
    }

    sqlx::query(&format!(
        "INSERT INTO {} (id, user_id, recipe_id) VALUES ($1, $2, $3)",
        mark.table()
    ))
    .bind(Uuid::new_v4())
    .bind(user.user_id)
    .bind(recipe_id)
    .execute(&state.pool)
    .await
    .map_err(|err| AppError::from_unique_violation(err, mark.already_message()))?;

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        mark.audit_action(true),
        Some(mark.table()),
        Some(serde_json::json!({ "recipe_id": recipe_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Added", recipe, Some(Meta::empty())))
}

pub async fn remove_mark(
    state: &AppState,
    user: &AuthUser,
    recipe_id: Uuid,
    mark: MarkTable,
) -> AppResult<ApiResponse<serde_json::Value>> {
    fetch_short_recipe(state, recipe_id).await?;

    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE user_id = $1 AND recipe_id = $2",
        mark.table()
    ))
    .bind(user.user_id)
    .bind(recipe_id)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::BadRequest(mark.missing_message().into()));
    }

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        mark.audit_action(false),
        Some(mark.table()),
        Some(serde_json::json!({ "recipe_id": recipe_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Removed",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}
