use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::recipes::ShortRecipe,
    dto::users::{SubscriptionList, SubscriptionProfile},
    entity::{
        follows::{ActiveModel as FollowActive, Column as FollowCol, Entity as Follows},
        users::{Entity as Users, Model as UserModel},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    services::user_service::profile_from_entity,
    state::AppState,
};

const ALREADY_SUBSCRIBED: &str = "You are already subscribed to this user.";
const NOT_SUBSCRIBED: &str = "You are not subscribed to this user yet.";

/// Profile + the author's recipes + recipe count, as served by both
/// subscribe and the subscriptions listing (is_subscribed is true by
/// construction there).
async fn subscription_profile(
    state: &AppState,
    author: &UserModel,
) -> AppResult<SubscriptionProfile> {
    let recipes: Vec<ShortRecipe> = sqlx::query_as(
        r#"
        SELECT id, name, image, cooking_time
        FROM recipes
        WHERE author_id = $1
        ORDER BY pub_date DESC
        "#,
    )
    .bind(author.id)
    .fetch_all(&state.pool)
    .await?;

    let recipes_count = recipes.len() as i64;
    Ok(SubscriptionProfile {
        profile: profile_from_entity(author, true),
        recipes,
        recipes_count,
    })
}

pub async fn subscribe(
    state: &AppState,
    user: &AuthUser,
    author_id: Uuid,
) -> AppResult<ApiResponse<SubscriptionProfile>> {
    let author = Users::find_by_id(author_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    if author.id == user.user_id {
        return Err(AppError::BadRequest(
            "You cannot subscribe to yourself.".into(),
        ));
    }

    let exists = Follows::find()
        .filter(FollowCol::UserId.eq(user.user_id))
        .filter(FollowCol::AuthorId.eq(author.id))
        .count(&state.orm)
        .await?;
    if exists > 0 {
        return Err(AppError::BadRequest(ALREADY_SUBSCRIBED.into()));
    }

    let insert = FollowActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        author_id: Set(author.id),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await;

    // The pre-check races concurrent subscribes; the unique constraint
    // is the backstop and must surface as the same validation error.
    if let Err(err) = insert {
        return Err(match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                AppError::BadRequest(ALREADY_SUBSCRIBED.into())
            }
            _ => err.into(),
        });
    }

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        "follow_add",
        Some("follows"),
        Some(serde_json::json!({ "author_id": author.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let data = subscription_profile(state, &author).await?;
    Ok(ApiResponse::success("Subscribed", data, Some(Meta::empty())))
}

pub async fn unsubscribe(
    state: &AppState,
    user: &AuthUser,
    author_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    Users::find_by_id(author_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    let result = Follows::delete_many()
        .filter(FollowCol::UserId.eq(user.user_id))
        .filter(FollowCol::AuthorId.eq(author_id))
        .exec(&state.orm)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::BadRequest(NOT_SUBSCRIBED.into()));
    }

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.user_id),
        "follow_remove",
        Some("follows"),
        Some(serde_json::json!({ "author_id": author_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Unsubscribed",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn list_subscriptions(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<SubscriptionList>> {
    let (page, limit, offset) = pagination.normalize();

    let finder = Follows::find().filter(FollowCol::UserId.eq(user.user_id));
    let total = finder.clone().count(&state.orm).await? as i64;

    let follows = finder
        .order_by_desc(FollowCol::CreatedAt)
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let author_ids: Vec<Uuid> = follows.iter().map(|follow| follow.author_id).collect();
    let authors = Users::find()
        .filter(crate::entity::users::Column::Id.is_in(author_ids.clone()))
        .all(&state.orm)
        .await?;

    // Preserve the follow ordering, not the fetch ordering.
    let mut items = Vec::with_capacity(author_ids.len());
    for author_id in author_ids {
        if let Some(author) = authors.iter().find(|author| author.id == author_id) {
            items.push(subscription_profile(state, author).await?);
        }
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "OK",
        SubscriptionList { items },
        Some(meta),
    ))
}
