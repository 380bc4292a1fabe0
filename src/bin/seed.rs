use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum_recipes_api::{config::AppConfig, db::create_pool};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let chef_id = ensure_user(&pool, "chef@example.com", "chef", "chef123").await?;
    let eater_id = ensure_user(&pool, "eater@example.com", "eater", "eater123").await?;
    seed_tags(&pool).await?;
    seed_ingredients(&pool).await?;

    println!("Seed completed. Chef ID: {chef_id}, Eater ID: {eater_id}");
    Ok(())
}

async fn ensure_user(
    pool: &sqlx::PgPool,
    email: &str,
    username: &str,
    password: &str,
) -> anyhow::Result<Uuid> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    if let Some((id,)) = row {
        return Ok(id);
    }

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .to_string();

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO users (id, email, username, first_name, last_name, password_hash)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(email)
    .bind(username)
    .bind("Demo")
    .bind("User")
    .bind(password_hash)
    .execute(pool)
    .await?;
    Ok(id)
}

async fn seed_tags(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let tags = [
        ("Breakfast", "#E26C2D", "breakfast"),
        ("Lunch", "#49B64E", "lunch"),
        ("Dinner", "#8775D2", "dinner"),
    ];
    for (name, color, slug) in tags {
        sqlx::query(
            r#"
            INSERT INTO tags (id, name, color, slug)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (slug) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(color)
        .bind(slug)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn seed_ingredients(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let ingredients = [
        ("Salt", "g"),
        ("Sugar", "g"),
        ("Flour", "g"),
        ("Milk", "ml"),
        ("Eggs", "pcs"),
        ("Butter", "g"),
    ];
    for (name, unit) in ingredients {
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM ingredients WHERE name = $1 AND measurement_unit = $2")
                .bind(name)
                .bind(unit)
                .fetch_optional(pool)
                .await?;
        if exists.is_some() {
            continue;
        }
        sqlx::query("INSERT INTO ingredients (id, name, measurement_unit) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(unit)
            .execute(pool)
            .await?;
    }
    Ok(())
}
