use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use axum_recipes_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::auth::LoginRequest,
    dto::recipes::{CreateRecipeRequest, IngredientAmountIn, UpdateRecipeRequest},
    dto::users::RegisterRequest,
    entity::{
        ingredients::ActiveModel as IngredientActive, tags::ActiveModel as TagActive,
        users::ActiveModel as UserActive,
    },
    middleware::auth::AuthUser,
    routes::{
        ingredients::{self, IngredientQuery},
        params::{Pagination, RecipeListQuery},
        users,
    },
    services::{
        auth_service, follow_service, recipe_service, shopping_list_service, toggle_service,
        user_service,
    },
    state::AppState,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set, Statement};
use std::sync::OnceLock;
use uuid::Uuid;

const IMAGE: &str = "data:image/png;base64,aGVsbG8=";

// The flows truncate shared tables, so they must not interleave.
static DB_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

async fn db_guard() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK
        .get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

// Integration flow: author publishes recipes, another user favorites them,
// fills a cart and downloads the aggregated shopping list.
#[tokio::test]
async fn recipe_favorite_cart_and_shopping_list_flow() -> anyhow::Result<()> {
    let _guard = db_guard().await;
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let chef_id = create_user(&state, "chef@example.com", "chef").await?;
    let eater_id = create_user(&state, "eater@example.com", "eater").await?;
    let chef = AuthUser { user_id: chef_id };
    let eater = AuthUser { user_id: eater_id };

    let breakfast = create_tag(&state, "Breakfast", "#E26C2D", "breakfast").await?;
    let lunch = create_tag(&state, "Lunch", "#49B64E", "lunch").await?;
    let salt = create_ingredient(&state, "Salt", "g").await?;
    let sugar = create_ingredient(&state, "Sugar", "g").await?;

    // Validation failures never leave partial writes behind.
    let empty_ingredients = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload("Porridge", vec![breakfast], vec![]),
    )
    .await;
    assert!(empty_ingredients.is_err());

    let duplicate_ingredient = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload(
            "Porridge",
            vec![breakfast],
            vec![pair(salt, 2), pair(salt, 3)],
        ),
    )
    .await;
    assert!(duplicate_ingredient.is_err());

    let zero_amount = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload("Porridge", vec![breakfast], vec![pair(salt, 0)]),
    )
    .await;
    assert!(zero_amount.is_err());

    // Successful create returns the read representation.
    let porridge = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload("Porridge", vec![breakfast], vec![pair(salt, 5), pair(sugar, 3)]),
    )
    .await?
    .data
    .unwrap();
    assert_eq!(porridge.name, "Porridge");
    assert_eq!(porridge.ingredients.len(), 2);
    assert_eq!(porridge.author.id, chef_id);
    assert!(!porridge.is_favorited);
    let submitted_total: i32 = porridge.ingredients.iter().map(|i| i.amount).sum();
    assert_eq!(submitted_total, 8);

    let soup = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload("Soup", vec![lunch], vec![pair(salt, 10)]),
    )
    .await?
    .data
    .unwrap();

    // Anonymous readers always see both flags false.
    let anonymous = recipe_service::get_recipe(&state, None, porridge.id)
        .await?
        .data
        .unwrap();
    assert!(!anonymous.is_favorited);
    assert!(!anonymous.is_in_shopping_cart);

    // Favorite toggle: duplicate add and missing remove both fail.
    let short = toggle_service::add_mark(
        &state,
        &eater,
        porridge.id,
        toggle_service::MarkTable::Favorites,
    )
    .await?
    .data
    .unwrap();
    assert_eq!(short.id, porridge.id);
    assert_eq!(short.cooking_time, 30);

    let again = toggle_service::add_mark(
        &state,
        &eater,
        porridge.id,
        toggle_service::MarkTable::Favorites,
    )
    .await;
    assert!(again.is_err());

    let favorited_view = recipe_service::get_recipe(&state, Some(eater_id), porridge.id)
        .await?
        .data
        .unwrap();
    assert!(favorited_view.is_favorited);
    assert!(!favorited_view.is_in_shopping_cart);

    toggle_service::remove_mark(
        &state,
        &eater,
        porridge.id,
        toggle_service::MarkTable::Favorites,
    )
    .await?;
    let remove_again = toggle_service::remove_mark(
        &state,
        &eater,
        porridge.id,
        toggle_service::MarkTable::Favorites,
    )
    .await;
    assert!(remove_again.is_err());

    // Cart both recipes; Salt appears in both and must collapse to one line.
    toggle_service::add_mark(
        &state,
        &eater,
        porridge.id,
        toggle_service::MarkTable::ShoppingCart,
    )
    .await?;
    toggle_service::add_mark(
        &state,
        &eater,
        soup.id,
        toggle_service::MarkTable::ShoppingCart,
    )
    .await?;

    let shopping_list = shopping_list_service::build_shopping_list(&state, &eater).await?;
    assert!(shopping_list.starts_with("Shopping List\n"));
    assert!(shopping_list.contains("Salt (g) 15\n"));
    assert_eq!(shopping_list.matches("Salt").count(), 1);

    // Tag filter is a union, never an intersection.
    let both = recipe_service::list_recipes(
        &state,
        None,
        RecipeListQuery {
            tags: vec!["breakfast".into(), "lunch".into()],
            ..Default::default()
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(both.items.len(), 2);

    let breakfast_only = recipe_service::list_recipes(
        &state,
        None,
        RecipeListQuery {
            tags: vec!["breakfast".into()],
            ..Default::default()
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(breakfast_only.items.len(), 1);
    assert_eq!(breakfast_only.items[0].name, "Porridge");

    // Anonymous + user-relative filter selects nothing.
    let anonymous_favorites = recipe_service::list_recipes(
        &state,
        None,
        RecipeListQuery {
            is_favorited: Some(true),
            ..Default::default()
        },
    )
    .await?
    .data
    .unwrap();
    assert!(anonymous_favorites.items.is_empty());

    // Authenticated cart filter matches the cart contents exactly.
    let in_cart = recipe_service::list_recipes(
        &state,
        Some(eater_id),
        RecipeListQuery {
            is_in_shopping_cart: Some(true),
            ..Default::default()
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(in_cart.items.len(), 2);

    let not_in_cart = recipe_service::list_recipes(
        &state,
        Some(eater_id),
        RecipeListQuery {
            is_in_shopping_cart: Some(false),
            ..Default::default()
        },
    )
    .await?
    .data
    .unwrap();
    assert!(not_in_cart.items.is_empty());

    Ok(())
}

#[tokio::test]
async fn recipe_update_replaces_lists_and_enforces_author() -> anyhow::Result<()> {
    let _guard = db_guard().await;
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let chef_id = create_user(&state, "author@example.com", "author").await?;
    let other_id = create_user(&state, "other@example.com", "other").await?;
    let chef = AuthUser { user_id: chef_id };
    let other = AuthUser { user_id: other_id };

    let dinner = create_tag(&state, "Dinner", "#8775D2", "dinner").await?;
    let brunch = create_tag(&state, "Brunch", "#AABBCC", "brunch").await?;
    let flour = create_ingredient(&state, "Flour", "g").await?;
    let milk = create_ingredient(&state, "Milk", "ml").await?;

    let recipe = recipe_service::create_recipe(
        &state,
        &chef,
        recipe_payload("Pancakes", vec![dinner], vec![pair(flour, 200)]),
    )
    .await?
    .data
    .unwrap();

    // Non-author mutation is forbidden.
    let forbidden = recipe_service::delete_recipe(&state, &other, recipe.id).await;
    assert!(forbidden.is_err());

    // A supplied ingredient list is a full replace, not a merge.
    let updated = recipe_service::update_recipe(
        &state,
        &chef,
        recipe.id,
        UpdateRecipeRequest {
            name: None,
            text: None,
            cooking_time: Some(45),
            image: None,
            tags: Some(vec![brunch]),
            ingredients: Some(vec![pair(milk, 300)]),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(updated.cooking_time, 45);
    assert_eq!(updated.tags.len(), 1);
    assert_eq!(updated.tags[0].slug, "brunch");
    assert_eq!(updated.ingredients.len(), 1);
    assert_eq!(updated.ingredients[0].name, "Milk");
    assert_eq!(updated.ingredients[0].amount, 300);

    recipe_service::delete_recipe(&state, &chef, recipe.id).await?;
    let gone = recipe_service::get_recipe(&state, None, recipe.id).await;
    assert!(gone.is_err());

    Ok(())
}

#[tokio::test]
async fn subscription_flow() -> anyhow::Result<()> {
    let _guard = db_guard().await;
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let reader_id = create_user(&state, "reader@example.com", "reader").await?;
    let author_id = create_user(&state, "writer@example.com", "writer").await?;
    let reader = AuthUser { user_id: reader_id };

    let tag = create_tag(&state, "Snack", "#123456", "snack").await?;
    let nuts = create_ingredient(&state, "Nuts", "g").await?;
    let author_user = AuthUser { user_id: author_id };
    recipe_service::create_recipe(
        &state,
        &author_user,
        recipe_payload("Trail Mix", vec![tag], vec![pair(nuts, 50)]),
    )
    .await?;

    // Self-follow is rejected.
    let self_follow = follow_service::subscribe(&state, &reader, reader_id).await;
    assert!(self_follow.is_err());

    let subscribed = follow_service::subscribe(&state, &reader, author_id)
        .await?
        .data
        .unwrap();
    assert!(subscribed.profile.is_subscribed);
    assert_eq!(subscribed.recipes_count, 1);
    assert_eq!(subscribed.recipes[0].name, "Trail Mix");

    let duplicate = follow_service::subscribe(&state, &reader, author_id).await;
    assert!(duplicate.is_err());

    let listed = follow_service::list_subscriptions(&state, &reader, Pagination::default())
        .await?
        .data
        .unwrap();
    assert_eq!(listed.items.len(), 1);
    assert_eq!(listed.items[0].profile.id, author_id);

    follow_service::unsubscribe(&state, &reader, author_id).await?;
    let missing = follow_service::unsubscribe(&state, &reader, author_id).await;
    assert!(missing.is_err());

    // Follow -> unfollow -> follow leaves no residual conflict.
    let again = follow_service::subscribe(&state, &reader, author_id).await;
    assert!(again.is_ok());

    Ok(())
}

#[tokio::test]
async fn register_login_and_me_flow() -> anyhow::Result<()> {
    let _guard = db_guard().await;
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    // login_user signs with the same secret the extractor verifies.
    unsafe {
        std::env::set_var("JWT_SECRET", "integration-test-secret");
    }

    let registered = user_service::register_user(&state, register_payload("new@example.com"))
        .await?
        .data
        .unwrap();
    assert_eq!(registered.email, "new@example.com");
    assert!(!registered.is_subscribed);

    let duplicate = user_service::register_user(&state, register_payload("new@example.com")).await;
    assert!(duplicate.is_err());

    let login = auth_service::login_user(
        &state,
        LoginRequest {
            email: "new@example.com".into(),
            password: "hunter2!".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert!(login.token.starts_with("Bearer "));

    let wrong_password = auth_service::login_user(
        &state,
        LoginRequest {
            email: "new@example.com".into(),
            password: "nope".into(),
        },
    )
    .await;
    assert!(wrong_password.is_err());

    let me = user_service::me(&state, registered.id).await?.data.unwrap();
    assert_eq!(me.username, "newcomer");

    // The route answers 201, not the envelope's default 200.
    let (status, Json(body)) = users::register(
        State(state.clone()),
        Json(register_payload("second@example.com")),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body.data.unwrap().email, "second@example.com");

    Ok(())
}

#[tokio::test]
async fn ingredient_search_is_a_literal_prefix_match() -> anyhow::Result<()> {
    let _guard = db_guard().await;
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    create_ingredient(&state, "Salt", "g").await?;
    create_ingredient(&state, "Sugar", "g").await?;
    create_ingredient(&state, "100% Cocoa", "g").await?;

    let search = |name: Option<&str>| {
        let query = IngredientQuery {
            name: name.map(str::to_string),
        };
        ingredients::list_ingredients(State(state.clone()), Query(query))
    };

    let all = search(None).await?.0.data.unwrap();
    assert_eq!(all.items.len(), 3);

    // Case-insensitive on the prefix only, never substring.
    let salt = search(Some("sa")).await?.0.data.unwrap();
    assert_eq!(salt.items.len(), 1);
    assert_eq!(salt.items[0].name, "Salt");

    let substring = search(Some("alt")).await?.0.data.unwrap();
    assert!(substring.items.is_empty());

    // LIKE metacharacters in the query match themselves.
    let percent = search(Some("100%")).await?.0.data.unwrap();
    assert_eq!(percent.items.len(), 1);
    assert_eq!(percent.items[0].name, "100% Cocoa");

    let lone_wildcard = search(Some("%")).await?.0.data.unwrap();
    assert!(lone_wildcard.items.is_empty());

    let underscore = search(Some("100_")).await?.0.data.unwrap();
    assert!(underscore.items.is_empty());

    Ok(())
}

fn register_payload(email: &str) -> RegisterRequest {
    RegisterRequest {
        email: email.to_string(),
        username: "newcomer".to_string(),
        first_name: "New".to_string(),
        last_name: "Comer".to_string(),
        password: "hunter2!".to_string(),
    }
}

fn pair(id: Uuid, amount: i32) -> IngredientAmountIn {
    IngredientAmountIn { id, amount }
}

fn recipe_payload(
    name: &str,
    tags: Vec<Uuid>,
    ingredients: Vec<IngredientAmountIn>,
) -> CreateRecipeRequest {
    CreateRecipeRequest {
        name: name.to_string(),
        text: format!("How to make {name}."),
        cooking_time: 30,
        image: IMAGE.to_string(),
        tags,
        ingredients,
    }
}

// Allow skipping when no DB is configured in the environment.
async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE audit_logs, recipe_ingredients, recipe_tags, favorites, shopping_carts, follows, recipes, ingredients, tags, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    Ok(Some(AppState { pool, orm }))
}

async fn create_user(state: &AppState, email: &str, username: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        username: Set(username.to_string()),
        first_name: Set("Test".into()),
        last_name: Set("User".into()),
        password_hash: Set("dummy".into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}

async fn create_tag(
    state: &AppState,
    name: &str,
    color: &str,
    slug: &str,
) -> anyhow::Result<Uuid> {
    let tag = TagActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        color: Set(color.to_string()),
        slug: Set(slug.to_string()),
    }
    .insert(&state.orm)
    .await?;
    Ok(tag.id)
}

async fn create_ingredient(state: &AppState, name: &str, unit: &str) -> anyhow::Result<Uuid> {
    let ingredient = IngredientActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        measurement_unit: Set(unit.to_string()),
    }
    .insert(&state.orm)
    .await?;
    Ok(ingredient.id)
}
