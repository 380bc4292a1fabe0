use sqlx::FromRow;

use crate::{error::AppResult, middleware::auth::AuthUser, state::AppState};

#[derive(Debug, PartialEq, FromRow)]
pub struct ShoppingListRow {
    pub name: String,
    pub measurement_unit: String,
    pub total: i64,
}

/// Render the aggregated rows as the downloadable plain-text report.
pub fn render_shopping_list(rows: &[ShoppingListRow]) -> String {
    let mut out = String::from("Shopping List\n");
    for row in rows {
        out.push_str(&format!(
            "{} ({}) {}\n",
            row.name, row.measurement_unit, row.total
        ));
    }
    out
}

/// Group ingredients across the user's cart recipes by (name, unit),
/// summing amounts; one output row per distinct pair.
pub async fn build_shopping_list(state: &AppState, user: &AuthUser) -> AppResult<String> {
    let rows: Vec<ShoppingListRow> = sqlx::query_as(
        r#"
        SELECT i.name, i.measurement_unit, SUM(ri.amount)::BIGINT AS total
        FROM shopping_carts sc
        JOIN recipe_ingredients ri ON ri.recipe_id = sc.recipe_id
        JOIN ingredients i ON i.id = ri.ingredient_id
        WHERE sc.user_id = $1
        GROUP BY i.name, i.measurement_unit
        ORDER BY i.name, i.measurement_unit
        "#,
    )
    .bind(user.user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(render_shopping_list(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, unit: &str, total: i64) -> ShoppingListRow {
        ShoppingListRow {
            name: name.to_string(),
            measurement_unit: unit.to_string(),
            total,
        }
    }

    #[test]
    fn renders_header_for_empty_cart() {
        assert_eq!(render_shopping_list(&[]), "Shopping List\n");
    }

    #[test]
    fn renders_one_line_per_name_unit_pair() {
        // Two cart recipes contributing 5 + 10 of the same ingredient
        // collapse into a single summed row upstream.
        let rows = vec![row("Salt", "g", 15), row("Sugar", "g", 3)];
        assert_eq!(
            render_shopping_list(&rows),
            "Shopping List\nSalt (g) 15\nSugar (g) 3\n"
        );
    }

    #[test]
    fn same_name_different_unit_stays_separate() {
        let rows = vec![row("Milk", "l", 2), row("Milk", "ml", 200)];
        let text = render_shopping_list(&rows);
        assert!(text.contains("Milk (l) 2\n"));
        assert!(text.contains("Milk (ml) 200\n"));
    }
}
