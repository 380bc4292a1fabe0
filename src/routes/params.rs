use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Default, Clone, Deserialize, ToSchema)]
pub struct Pagination {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl Pagination {
    pub fn normalize(&self) -> (i64, i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * per_page;
        (page, per_page, offset)
    }
}

/// Recipe list filters. `tags` is repeatable (OR over slugs), and the two
/// boolean filters are tri-state: true / false / absent. `1` and `0` are
/// accepted as aliases for true and false.
#[derive(Debug, Default)]
pub struct RecipeListQuery {
    pub pagination: Pagination,
    pub author: Option<Uuid>,
    pub tags: Vec<String>,
    pub is_favorited: Option<bool>,
    pub is_in_shopping_cart: Option<bool>,
}

fn parse_flag(key: &str, value: &str) -> Result<bool, AppError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(AppError::BadRequest(format!(
            "{key} must be true, false, 1 or 0"
        ))),
    }
}

fn parse_page(key: &str, value: &str) -> Result<i64, AppError> {
    value
        .parse::<i64>()
        .map_err(|_| AppError::BadRequest(format!("{key} must be an integer")))
}

impl RecipeListQuery {
    /// Built from raw query pairs because `tags` may repeat, which a plain
    /// struct deserialization would collapse to the last value.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, AppError> {
        let mut query = RecipeListQuery::default();
        for (key, value) in pairs {
            match key.as_str() {
                "page" => query.pagination.page = Some(parse_page(key, value)?),
                "per_page" => query.pagination.per_page = Some(parse_page(key, value)?),
                "author" => {
                    let author = Uuid::parse_str(value)
                        .map_err(|_| AppError::BadRequest("author must be a uuid".into()))?;
                    query.author = Some(author);
                }
                "tags" => query.tags.push(value.clone()),
                "is_favorited" => query.is_favorited = Some(parse_flag(key, value)?),
                "is_in_shopping_cart" => {
                    query.is_in_shopping_cart = Some(parse_flag(key, value)?)
                }
                _ => {}
            }
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn collects_repeated_tags() {
        let query =
            RecipeListQuery::from_pairs(&pairs(&[("tags", "breakfast"), ("tags", "lunch")]))
                .unwrap();
        assert_eq!(query.tags, vec!["breakfast", "lunch"]);
    }

    #[test]
    fn flags_are_tri_state_with_numeric_aliases() {
        let unset = RecipeListQuery::from_pairs(&[]).unwrap();
        assert_eq!(unset.is_favorited, None);
        assert_eq!(unset.is_in_shopping_cart, None);

        let set = RecipeListQuery::from_pairs(&pairs(&[
            ("is_favorited", "1"),
            ("is_in_shopping_cart", "false"),
        ]))
        .unwrap();
        assert_eq!(set.is_favorited, Some(true));
        assert_eq!(set.is_in_shopping_cart, Some(false));
    }

    #[test]
    fn rejects_junk_flag_values() {
        assert!(RecipeListQuery::from_pairs(&pairs(&[("is_favorited", "yes")])).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let query = RecipeListQuery::from_pairs(&pairs(&[("limit", "5")])).unwrap();
        assert!(query.author.is_none());
        assert!(query.tags.is_empty());
    }

    #[test]
    fn pagination_normalizes_bounds() {
        let pagination = Pagination {
            page: Some(0),
            per_page: Some(1000),
        };
        assert_eq!(pagination.normalize(), (1, 100, 0));
    }
}
