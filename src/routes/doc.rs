use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{LoginRequest, LoginResponse},
        recipes::{
            CreateRecipeRequest, IngredientAmountIn, IngredientAmountOut, RecipeList,
            RecipeResponse, ShortRecipe, UpdateRecipeRequest,
        },
        users::{RegisterRequest, SubscriptionList, SubscriptionProfile, UserList, UserProfile},
    },
    models::{Ingredient, Tag},
    response::{ApiResponse, Meta},
    routes::{auth, health, ingredients, params, recipes, tags, users},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::login,
        users::register,
        users::list_users,
        users::me,
        users::subscriptions,
        users::get_user,
        users::subscribe,
        users::unsubscribe,
        tags::list_tags,
        tags::get_tag,
        ingredients::list_ingredients,
        ingredients::get_ingredient,
        recipes::list_recipes,
        recipes::get_recipe,
        recipes::create_recipe,
        recipes::update_recipe,
        recipes::delete_recipe,
        recipes::add_favorite,
        recipes::remove_favorite,
        recipes::add_to_cart,
        recipes::remove_from_cart,
        recipes::download_shopping_cart
    ),
    components(
        schemas(
            Tag,
            Ingredient,
            UserProfile,
            UserList,
            SubscriptionProfile,
            SubscriptionList,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            CreateRecipeRequest,
            UpdateRecipeRequest,
            IngredientAmountIn,
            IngredientAmountOut,
            RecipeResponse,
            RecipeList,
            ShortRecipe,
            tags::TagList,
            ingredients::IngredientList,
            ingredients::IngredientQuery,
            params::Pagination,
            Meta,
            ApiResponse<RecipeResponse>,
            ApiResponse<RecipeList>,
            ApiResponse<ShortRecipe>,
            ApiResponse<UserProfile>,
            ApiResponse<SubscriptionProfile>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Users", description = "User and subscription endpoints"),
        (name = "Tags", description = "Tag endpoints"),
        (name = "Ingredients", description = "Ingredient endpoints"),
        (name = "Recipes", description = "Recipe, favorite and shopping-cart endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
