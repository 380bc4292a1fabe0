use crate::db::{DbPool, OrmConn};

/// Shared handler state. `orm` drives entity CRUD and the recipe write
/// transactions; `pool` serves the raw-SQL joins, toggles and the
/// shopping-list aggregation. Both point at the same database.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
}
