use std::collections::{HashMap, HashSet};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{Expr, Query as SeaQuery},
};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::recipes::{
        CreateRecipeRequest, IngredientAmountIn, IngredientAmountOut, RecipeList, RecipeResponse,
        UpdateRecipeRequest,
    },
    entity::{
        favorites::{Column as FavoriteCol, Entity as Favorites},
        ingredients::{Column as IngredientCol, Entity as Ingredients},
        recipe_ingredients::{
            ActiveModel as RecipeIngredientActive, Column as RecipeIngredientCol,
            Entity as RecipeIngredients,
        },
        recipe_tags::{ActiveModel as RecipeTagActive, Column as RecipeTagCol, Entity as RecipeTags},
        recipes::{
            ActiveModel as RecipeActive, Column as RecipeCol, Entity as Recipes,
            Model as RecipeModel,
        },
        shopping_carts::{Column as CartCol, Entity as ShoppingCarts},
        tags::{Column as TagCol, Entity as Tags},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::Tag,
    response::{ApiResponse, Meta},
    routes::params::RecipeListQuery,
    services::user_service::profile_from_user,
    state::AppState,
};

// ---------------------------------------------------------------------------
// Write-path validation. All checks run before any row is touched.
// ---------------------------------------------------------------------------

pub fn validate_tags(tags: &[Uuid]) -> Result<(), AppError> {
    if tags.is_empty() {
        return Err(AppError::BadRequest("There must be at least one tag.".into()));
    }
    Ok(())
}

pub fn validate_ingredients(ingredients: &[IngredientAmountIn]) -> Result<(), AppError> {
    if ingredients.is_empty() {
        return Err(AppError::BadRequest(
            "There must be at least one ingredient.".into(),
        ));
    }
    let mut seen = HashSet::new();
    for ingredient in ingredients {
        if !seen.insert(ingredient.id) {
            return Err(AppError::BadRequest(
                "A recipe cannot have two identical ingredients.".into(),
            ));
        }
        if ingredient.amount < 1 {
            return Err(AppError::BadRequest(
                "Ingredient amount must be at least 1.".into(),
            ));
        }
    }
    Ok(())
}

pub fn validate_cooking_time(cooking_time: i32) -> Result<(), AppError> {
    if cooking_time < 1 {
        return Err(AppError::BadRequest(
            "The minimum cooking time is 1 minute.".into(),
        ));
    }
    Ok(())
}

/// Accepts either a bare base64 payload or a `data:...;base64,` URL.
/// Only validity is checked; the encoded text itself is what gets stored.
pub fn validate_image(image: &str) -> Result<(), AppError> {
    let encoded = match image.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => image,
    };
    if encoded.is_empty() {
        return Err(AppError::BadRequest("Image must not be empty.".into()));
    }
    BASE64
        .decode(encoded)
        .map_err(|_| AppError::BadRequest("Image must be valid base64.".into()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Create / update / delete
// ---------------------------------------------------------------------------

async fn check_tags_exist<C: sea_orm::ConnectionTrait>(
    conn: &C,
    tag_ids: &[Uuid],
) -> AppResult<()> {
    let found = Tags::find()
        .filter(TagCol::Id.is_in(tag_ids.to_vec()))
        .count(conn)
        .await?;
    if found as usize != tag_ids.len() {
        return Err(AppError::NotFound);
    }
    Ok(())
}

async fn check_ingredients_exist<C: sea_orm::ConnectionTrait>(
    conn: &C,
    ingredients: &[IngredientAmountIn],
) -> AppResult<()> {
    let ids: Vec<Uuid> = ingredients.iter().map(|item| item.id).collect();
    let found = Ingredients::find()
        .filter(IngredientCol::Id.is_in(ids.clone()))
        .count(conn)
        .await?;
    if found as usize != ids.len() {
        return Err(AppError::NotFound);
    }
    Ok(())
}

fn dedup_tags(tags: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    tags.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub async fn create_recipe(
    state: &AppState,
    user: &AuthUser,
    payload: CreateRecipeRequest,
) -> AppResult<ApiResponse<RecipeResponse>> {
    validate_tags(&payload.tags)?;
    validate_ingredients(&payload.ingredients)?;
    validate_cooking_time(payload.cooking_time)?;
    validate_image(&payload.image)?;

    let tag_ids = dedup_tags(&payload.tags);

    let txn = state.orm.begin().await?;

    check_tags_exist(&txn, &tag_ids).await?;
    check_ingredients_exist(&txn, &payload.ingredients).await?;

    let recipe = RecipeActive {
        id: Set(Uuid::new_v4()),
        author_id: Set(user.user_id),
        name: Set(payload.name),
        image: Set(payload.image),
        text: Set(payload.text),
        cooking_time: Set(payload.cooking_time),
        pub_date: NotSet,
    }
    .insert(&txn)
    .await?;

    attach_tags(&txn, recipe.id, &tag_ids).await?;
    attach_ingredients(&txn, recipe.id, &payload.ingredients).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        "recipe_create",
        Some("recipes"),
        Some(serde_json::json!({ "recipe_id": recipe.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    // Writers are re-read through the read-path shape.
    let data = get_representation(state, Some(user.user_id), recipe.id).await?;
    Ok(ApiResponse::success(
        "Recipe created",
        data,
        Some(Meta::empty()),
    ))
}

async fn attach_tags<C: sea_orm::ConnectionTrait>(
    conn: &C,
    recipe_id: Uuid,
    tag_ids: &[Uuid],
) -> AppResult<()> {
    let rows: Vec<RecipeTagActive> = tag_ids
        .iter()
        .map(|tag_id| RecipeTagActive {
            recipe_id: Set(recipe_id),
            tag_id: Set(*tag_id),
        })
        .collect();
    RecipeTags::insert_many(rows).exec(conn).await?;
    Ok(())
}

async fn attach_ingredients<C: sea_orm::ConnectionTrait>(
    conn: &C,
    recipe_id: Uuid,
    ingredients: &[IngredientAmountIn],
) -> AppResult<()> {
    let rows: Vec<RecipeIngredientActive> = ingredients
        .iter()
        .map(|ingredient| RecipeIngredientActive {
            id: Set(Uuid::new_v4()),
            recipe_id: Set(recipe_id),
            ingredient_id: Set(ingredient.id),
            amount: Set(ingredient.amount),
        })
        .collect();
    RecipeIngredients::insert_many(rows).exec(conn).await?;
    Ok(())
}

pub async fn update_recipe(
    state: &AppState,
    user: &AuthUser,
    recipe_id: Uuid,
    payload: UpdateRecipeRequest,
) -> AppResult<ApiResponse<RecipeResponse>> {
    let recipe = Recipes::find_by_id(recipe_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    if recipe.author_id != user.user_id {
        return Err(AppError::Forbidden);
    }

    if let Some(tags) = payload.tags.as_deref() {
        validate_tags(tags)?;
    }
    if let Some(ingredients) = payload.ingredients.as_deref() {
        validate_ingredients(ingredients)?;
    }
    if let Some(cooking_time) = payload.cooking_time {
        validate_cooking_time(cooking_time)?;
    }
    if let Some(image) = payload.image.as_deref() {
        validate_image(image)?;
    }

    let txn = state.orm.begin().await?;

    let mut active: RecipeActive = recipe.into();
    if let Some(name) = payload.name {
        active.name = Set(name);
    }
    if let Some(text) = payload.text {
        active.text = Set(text);
    }
    if let Some(cooking_time) = payload.cooking_time {
        active.cooking_time = Set(cooking_time);
    }
    if let Some(image) = payload.image {
        active.image = Set(image);
    }
    let recipe = active.update(&txn).await?;

    // A supplied tag list replaces the association set wholesale.
    if let Some(tags) = payload.tags {
        let tag_ids = dedup_tags(&tags);
        check_tags_exist(&txn, &tag_ids).await?;
        RecipeTags::delete_many()
            .filter(RecipeTagCol::RecipeId.eq(recipe.id))
            .exec(&txn)
            .await?;
        attach_tags(&txn, recipe.id, &tag_ids).await?;
    }

    // A supplied ingredient list is a full replace, not a merge.
    if let Some(ingredients) = payload.ingredients {
        check_ingredients_exist(&txn, &ingredients).await?;
        RecipeIngredients::delete_many()
            .filter(RecipeIngredientCol::RecipeId.eq(recipe.id))
            .exec(&txn)
            .await?;
        attach_ingredients(&txn, recipe.id, &ingredients).await?;
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        "recipe_update",
        Some("recipes"),
        Some(serde_json::json!({ "recipe_id": recipe.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let data = get_representation(state, Some(user.user_id), recipe.id).await?;
    Ok(ApiResponse::success(
        "Recipe updated",
        data,
        Some(Meta::empty()),
    ))
}

pub async fn delete_recipe(
    state: &AppState,
    user: &AuthUser,
    recipe_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let recipe = Recipes::find_by_id(recipe_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    if recipe.author_id != user.user_id {
        return Err(AppError::Forbidden);
    }

    Recipes::delete_by_id(recipe.id).exec(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        "recipe_delete",
        Some("recipes"),
        Some(serde_json::json!({ "recipe_id": recipe_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Recipe deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

pub async fn get_recipe(
    state: &AppState,
    requester: Option<Uuid>,
    recipe_id: Uuid,
) -> AppResult<ApiResponse<RecipeResponse>> {
    let data = get_representation(state, requester, recipe_id).await?;
    Ok(ApiResponse::success("OK", data, Some(Meta::empty())))
}

async fn get_representation(
    state: &AppState,
    requester: Option<Uuid>,
    recipe_id: Uuid,
) -> AppResult<RecipeResponse> {
    let recipe = Recipes::find_by_id(recipe_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    let mut hydrated = hydrate_recipes(state, requester, vec![recipe]).await?;
    hydrated.pop().ok_or(AppError::NotFound)
}

pub async fn list_recipes(
    state: &AppState,
    requester: Option<Uuid>,
    query: RecipeListQuery,
) -> AppResult<ApiResponse<RecipeList>> {
    let (page, limit, offset) = query.pagination.normalize();

    // User-relative filters from an anonymous requester select nothing.
    if requester.is_none() && (query.is_favorited.is_some() || query.is_in_shopping_cart.is_some())
    {
        let meta = Meta::new(page, limit, 0);
        return Ok(ApiResponse::success(
            "OK",
            RecipeList { items: Vec::new() },
            Some(meta),
        ));
    }

    let mut condition = Condition::all();

    if let Some(author) = query.author {
        condition = condition.add(RecipeCol::AuthorId.eq(author));
    }

    if !query.tags.is_empty() {
        // At least one tag slug must match (OR semantics).
        let sub = SeaQuery::select()
            .column(RecipeTagCol::RecipeId)
            .from(RecipeTags)
            .inner_join(
                Tags,
                Expr::col((Tags, TagCol::Id)).equals((RecipeTags, RecipeTagCol::TagId)),
            )
            .and_where(TagCol::Slug.is_in(query.tags.clone()))
            .to_owned();
        condition = condition.add(Expr::col((Recipes, RecipeCol::Id)).in_subquery(sub));
    }

    if let Some(user_id) = requester {
        if let Some(flag) = query.is_favorited {
            let sub = SeaQuery::select()
                .column(FavoriteCol::RecipeId)
                .from(Favorites)
                .and_where(FavoriteCol::UserId.eq(user_id))
                .to_owned();
            condition = condition.add(if flag {
                Expr::col((Recipes, RecipeCol::Id)).in_subquery(sub)
            } else {
                Expr::col((Recipes, RecipeCol::Id)).not_in_subquery(sub)
            });
        }
        if let Some(flag) = query.is_in_shopping_cart {
            let sub = SeaQuery::select()
                .column(CartCol::RecipeId)
                .from(ShoppingCarts)
                .and_where(CartCol::UserId.eq(user_id))
                .to_owned();
            condition = condition.add(if flag {
                Expr::col((Recipes, RecipeCol::Id)).in_subquery(sub)
            } else {
                Expr::col((Recipes, RecipeCol::Id)).not_in_subquery(sub)
            });
        }
    }

    let finder = Recipes::find()
        .filter(condition)
        .order_by_desc(RecipeCol::PubDate);

    let total = finder.clone().count(&state.orm).await? as i64;

    let recipes = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let items = hydrate_recipes(state, requester, recipes).await?;
    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("OK", RecipeList { items }, Some(meta)))
}

#[derive(FromRow)]
struct RecipeTagRow {
    recipe_id: Uuid,
    id: Uuid,
    name: String,
    color: String,
    slug: String,
}

#[derive(FromRow)]
struct RecipeIngredientRow {
    recipe_id: Uuid,
    id: Uuid,
    name: String,
    measurement_unit: String,
    amount: i32,
}

/// Turn a page of recipe rows into full read representations with one
/// batched query per facet instead of per-recipe lookups.
async fn hydrate_recipes(
    state: &AppState,
    requester: Option<Uuid>,
    recipes: Vec<RecipeModel>,
) -> AppResult<Vec<RecipeResponse>> {
    if recipes.is_empty() {
        return Ok(Vec::new());
    }

    let recipe_ids: Vec<Uuid> = recipes.iter().map(|recipe| recipe.id).collect();
    let author_ids: Vec<Uuid> = {
        let mut seen = HashSet::new();
        recipes
            .iter()
            .map(|recipe| recipe.author_id)
            .filter(|id| seen.insert(*id))
            .collect()
    };

    let authors: Vec<crate::models::User> =
        sqlx::query_as("SELECT * FROM users WHERE id = ANY($1)")
            .bind(&author_ids)
            .fetch_all(&state.pool)
            .await?;
    let authors: HashMap<Uuid, crate::models::User> = authors
        .into_iter()
        .map(|author| (author.id, author))
        .collect();

    let followed: HashSet<Uuid> = match requester {
        Some(user_id) => {
            let rows: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT author_id FROM follows WHERE user_id = $1 AND author_id = ANY($2)",
            )
            .bind(user_id)
            .bind(&author_ids)
            .fetch_all(&state.pool)
            .await?;
            rows.into_iter().map(|row| row.0).collect()
        }
        None => HashSet::new(),
    };

    let tag_rows: Vec<RecipeTagRow> = sqlx::query_as(
        r#"
        SELECT rt.recipe_id, t.id, t.name, t.color, t.slug
        FROM recipe_tags rt
        JOIN tags t ON t.id = rt.tag_id
        WHERE rt.recipe_id = ANY($1)
        ORDER BY t.name
        "#,
    )
    .bind(&recipe_ids)
    .fetch_all(&state.pool)
    .await?;
    let mut tags_by_recipe: HashMap<Uuid, Vec<Tag>> = HashMap::new();
    for row in tag_rows {
        tags_by_recipe.entry(row.recipe_id).or_default().push(Tag {
            id: row.id,
            name: row.name,
            color: row.color,
            slug: row.slug,
        });
    }

    let ingredient_rows: Vec<RecipeIngredientRow> = sqlx::query_as(
        r#"
        SELECT ri.recipe_id, i.id, i.name, i.measurement_unit, ri.amount
        FROM recipe_ingredients ri
        JOIN ingredients i ON i.id = ri.ingredient_id
        WHERE ri.recipe_id = ANY($1)
        ORDER BY i.name
        "#,
    )
    .bind(&recipe_ids)
    .fetch_all(&state.pool)
    .await?;
    let mut ingredients_by_recipe: HashMap<Uuid, Vec<IngredientAmountOut>> = HashMap::new();
    for row in ingredient_rows {
        ingredients_by_recipe
            .entry(row.recipe_id)
            .or_default()
            .push(IngredientAmountOut {
                id: row.id,
                name: row.name,
                measurement_unit: row.measurement_unit,
                amount: row.amount,
            });
    }

    let (favorited, in_cart) = match requester {
        Some(user_id) => {
            let favorite_rows: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT recipe_id FROM favorites WHERE user_id = $1 AND recipe_id = ANY($2)",
            )
            .bind(user_id)
            .bind(&recipe_ids)
            .fetch_all(&state.pool)
            .await?;
            let cart_rows: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT recipe_id FROM shopping_carts WHERE user_id = $1 AND recipe_id = ANY($2)",
            )
            .bind(user_id)
            .bind(&recipe_ids)
            .fetch_all(&state.pool)
            .await?;
            (
                favorite_rows.into_iter().map(|row| row.0).collect(),
                cart_rows.into_iter().map(|row| row.0).collect(),
            )
        }
        None => (HashSet::new(), HashSet::new()),
    };

    let mut out = Vec::with_capacity(recipes.len());
    for recipe in recipes {
        let author = authors
            .get(&recipe.author_id)
            .ok_or(AppError::NotFound)?;
        let author = profile_from_user(author, followed.contains(&author.id));
        out.push(RecipeResponse {
            id: recipe.id,
            tags: tags_by_recipe.remove(&recipe.id).unwrap_or_default(),
            author,
            ingredients: ingredients_by_recipe
                .remove(&recipe.id)
                .unwrap_or_default(),
            is_favorited: favorited.contains(&recipe.id),
            is_in_shopping_cart: in_cart.contains(&recipe.id),
            name: recipe.name,
            image: recipe.image,
            text: recipe.text,
            cooking_time: recipe.cooking_time,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: Uuid, amount: i32) -> IngredientAmountIn {
        IngredientAmountIn { id, amount }
    }

    #[test]
    fn empty_tag_list_is_rejected() {
        assert!(validate_tags(&[]).is_err());
        assert!(validate_tags(&[Uuid::new_v4()]).is_ok());
    }

    #[test]
    fn empty_ingredient_list_is_rejected() {
        assert!(validate_ingredients(&[]).is_err());
    }

    #[test]
    fn duplicate_ingredient_is_rejected() {
        let id = Uuid::new_v4();
        let result = validate_ingredients(&[pair(id, 2), pair(id, 3)]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_amount_is_rejected() {
        assert!(validate_ingredients(&[pair(Uuid::new_v4(), 0)]).is_err());
        assert!(validate_ingredients(&[pair(Uuid::new_v4(), 1)]).is_ok());
    }

    #[test]
    fn cooking_time_must_be_positive() {
        assert!(validate_cooking_time(0).is_err());
        assert!(validate_cooking_time(-5).is_err());
        assert!(validate_cooking_time(1).is_ok());
    }

    #[test]
    fn image_accepts_bare_base64_and_data_urls() {
        assert!(validate_image("aGVsbG8=").is_ok());
        assert!(validate_image("data:image/png;base64,aGVsbG8=").is_ok());
        assert!(validate_image("not base64!!").is_err());
        assert!(validate_image("").is_err());
    }

    #[test]
    fn tag_dedup_preserves_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup_tags(&[a, b, a]), vec![a, b]);
    }
}
