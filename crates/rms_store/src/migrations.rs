//! Schema migrations, run automatically by `Store::open`. Exposed
//! separately so callers that already hold a pool (e.g. tests sharing one
//! in-memory database) can run them without going through `Store::open`.

pub mod run {
    use crate::error::StoreError;
    use sqlx::SqlitePool;

    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))
    }
}
