use rocket_db_pools::{sqlx, Database};

#[derive(Database)]
#[database("import_db")]
pub struct ImportDb(sqlx::PgPool);
