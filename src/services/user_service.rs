use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::users::{RegisterRequest, UserList, UserProfile},
    error::{AppError, AppResult},
    models::User,
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    state::AppState,
};

pub fn profile_from_user(user: &User, is_subscribed: bool) -> UserProfile {
    UserProfile {
        id: user.id,
        email: user.email.clone(),
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        is_subscribed,
    }
}

pub fn profile_from_entity(user: &crate::entity::users::Model, is_subscribed: bool) -> UserProfile {
    UserProfile {
        id: user.id,
        email: user.email.clone(),
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        is_subscribed,
    }
}

pub async fn register_user(
    state: &AppState,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<UserProfile>> {
    let RegisterRequest {
        email,
        username,
        first_name,
        last_name,
        password,
    } = payload;

    let exist: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(email.as_str())
        .fetch_optional(&state.pool)
        .await?;

    if exist.is_some() {
        return Err(AppError::BadRequest("Email is already taken".to_string()));
    }

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?
        .to_string();

    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, username, first_name, last_name, password_hash)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email.as_str())
    .bind(username.as_str())
    .bind(first_name.as_str())
    .bind(last_name.as_str())
    .bind(password_hash)
    .fetch_one(&state.pool)
    .await?;

    if let Err(err) = log_audit(
        &state.orm,
        Some(user.id),
        "user_register",
        Some("users"),
        Some(serde_json::json!({ "user_id": user.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "User created",
        profile_from_user(&user, false),
        None,
    ))
}

/// Existence check against follows for (requester, author). Anonymous
/// requesters always see `false`.
pub async fn is_subscribed(
    state: &AppState,
    requester: Option<Uuid>,
    author_id: Uuid,
) -> AppResult<bool> {
    let Some(user_id) = requester else {
        return Ok(false);
    };
    let exists: (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM follows WHERE user_id = $1 AND author_id = $2)",
    )
    .bind(user_id)
    .bind(author_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(exists.0)
}

pub async fn get_user(
    state: &AppState,
    requester: Option<Uuid>,
    user_id: Uuid,
) -> AppResult<ApiResponse<UserProfile>> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or(AppError::NotFound)?;

    let subscribed = is_subscribed(state, requester, user.id).await?;
    Ok(ApiResponse::success(
        "OK",
        profile_from_user(&user, subscribed),
        Some(Meta::empty()),
    ))
}

pub async fn list_users(
    state: &AppState,
    requester: Option<Uuid>,
    pagination: Pagination,
) -> AppResult<ApiResponse<UserList>> {
    let (page, limit, offset) = pagination.normalize();
    let users: Vec<User> =
        sqlx::query_as("SELECT * FROM users ORDER BY created_at LIMIT $1 OFFSET $2")
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.pool)
            .await?;

    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&state.pool)
        .await?;

    let followed: Vec<Uuid> = match requester {
        Some(user_id) => {
            let rows: Vec<(Uuid,)> =
                sqlx::query_as("SELECT author_id FROM follows WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_all(&state.pool)
                    .await?;
            rows.into_iter().map(|row| row.0).collect()
        }
        None => Vec::new(),
    };

    let items = users
        .iter()
        .map(|user| profile_from_user(user, followed.contains(&user.id)))
        .collect();

    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success("OK", UserList { items }, Some(meta)))
}

pub async fn me(state: &AppState, user_id: Uuid) -> AppResult<ApiResponse<UserProfile>> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or(AppError::NotFound)?;
    Ok(ApiResponse::success(
        "OK",
        profile_from_user(&user, false),
        Some(Meta::empty()),
    ))
}
