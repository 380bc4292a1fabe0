use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dto::users::UserProfile;
use crate::models::Tag;

/// Write-side ingredient reference: primitive id plus amount.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct IngredientAmountIn {
    pub id: Uuid,
    pub amount: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRecipeRequest {
    pub name: String,
    pub text: String,
    pub cooking_time: i32,
    /// Base64-encoded image payload.
    pub image: String,
    pub tags: Vec<Uuid>,
    pub ingredients: Vec<IngredientAmountIn>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRecipeRequest {
    pub name: Option<String>,
    pub text: Option<String>,
    pub cooking_time: Option<i32>,
    pub image: Option<String>,
    /// When supplied, replaces the tag set wholesale.
    pub tags: Option<Vec<Uuid>>,
    /// When supplied, existing ingredient rows are deleted and re-inserted.
    pub ingredients: Option<Vec<IngredientAmountIn>>,
}

/// Read-side ingredient row joined through recipe_ingredients.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct IngredientAmountOut {
    pub id: Uuid,
    pub name: String,
    pub measurement_unit: String,
    pub amount: i32,
}

/// Full read representation; writers are re-read through this shape too.
#[derive(Debug, Serialize, ToSchema)]
pub struct RecipeResponse {
    pub id: Uuid,
    pub tags: Vec<Tag>,
    pub author: UserProfile,
    pub ingredients: Vec<IngredientAmountOut>,
    pub is_favorited: bool,
    pub is_in_shopping_cart: bool,
    pub name: String,
    pub image: String,
    pub text: String,
    pub cooking_time: i32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(transparent)]
pub struct RecipeList {
    #[schema(value_type = Vec<RecipeResponse>)]
    pub items: Vec<RecipeResponse>,
}

/// Minimal recipe view for toggle responses and subscription lists.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct ShortRecipe {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub cooking_time: i32,
}
