use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::pooled_connection::PoolError;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use thiserror::Error;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("product not found")]
    NotFound,

    #[error("insufficient inventory: {available} left, {requested} requested")]
    InsufficientInventory { available: i32, requested: i32 },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<bb8::RunError<PoolError>> for StoreError {
    fn from(err: bb8::RunError<PoolError>) -> Self {
        StoreError::Pool(err.to_string())
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Result<Product, StoreError>;

    /// Stores a new product and returns the id assigned to it.
    async fn create(&self, fields: ProductFields) -> Result<String, StoreError>;

    async fn replace(&self, id: &str, fields: ProductFields) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Takes `quantity` units out of stock in one step, refusing to go below zero.
    /// Returns the remaining count.
    async fn subtract(&self, id: &str, quantity: i32) -> Result<i32, StoreError>;
}

pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn get(&self, id: &str) -> Result<Product, StoreError> {
        let mut conn = self.pool.get().await?;
        products::table
            .find(id)
            .first::<Product>(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, fields: ProductFields) -> Result<String, StoreError> {
        let mut conn = self.pool.get().await?;
        let product = fields.into_product(Uuid::new_v4().to_string());

        diesel::insert_into(products::table)
            .values(&product)
            .execute(&mut conn)
            .await?;

        Ok(product.id)
    }

    async fn replace(&self, id: &str, fields: ProductFields) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(products::table.find(id))
            .set(&fields)
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel::delete(products::table.find(id))
            .execute(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn subtract(&self, id: &str, quantity: i32) -> Result<i32, StoreError> {
        let mut conn = self.pool.get().await?;

        let remaining = diesel::update(
            products::table
                .filter(products::id.eq(id))
                .filter(products::inventory_count.ge(quantity)),
        )
        .set(products::inventory_count.eq(products::inventory_count - quantity))
        .returning(products::inventory_count)
        .get_result::<i32>(&mut conn)
        .await
        .optional()?;

        if let Some(remaining) = remaining {
            return Ok(remaining);
        }

        let available = products::table
            .find(id)
            .select(products::inventory_count)
            .first::<i32>(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound)?;
        Err(StoreError::InsufficientInventory { available, requested: quantity })
    }
}

#[cfg(test)]
pub mod memory {
    use super::{InventoryStore, StoreError};
    use crate::models::{Product, ProductFields};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    pub struct MemoryInventoryStore {
        products: Mutex<HashMap<String, Product>>,
        unavailable: AtomicBool,
    }

    impl MemoryInventoryStore {
        pub fn with(products: impl IntoIterator<Item = Product>) -> Self {
            let store = Self::default();
            store
                .products
                .lock()
                .unwrap()
                .extend(products.into_iter().map(|p| (p.id.clone(), p)));
            store
        }

        /// Makes every operation fail as if the database were down.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Pool("database unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl InventoryStore for MemoryInventoryStore {
        async fn get(&self, id: &str) -> Result<Product, StoreError> {
            self.check()?;
            self.products.lock().unwrap().get(id).cloned().ok_or(StoreError::NotFound)
        }

        async fn create(&self, fields: ProductFields) -> Result<String, StoreError> {
            self.check()?;
            let product = fields.into_product(Uuid::new_v4().to_string());
            let id = product.id.clone();
            self.products.lock().unwrap().insert(id.clone(), product);
            Ok(id)
        }

        async fn replace(&self, id: &str, fields: ProductFields) -> Result<(), StoreError> {
            self.check()?;
            let mut products = self.products.lock().unwrap();
            let product = products.get_mut(id).ok_or(StoreError::NotFound)?;
            *product = fields.into_product(id.to_string());
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.check()?;
            self.products.lock().unwrap().remove(id).map(|_| ()).ok_or(StoreError::NotFound)
        }

        async fn subtract(&self, id: &str, quantity: i32) -> Result<i32, StoreError> {
            self.check()?;
            let mut products = self.products.lock().unwrap();
            let product = products.get_mut(id).ok_or(StoreError::NotFound)?;
            if product.inventory_count < quantity {
                return Err(StoreError::InsufficientInventory {
                    available: product.inventory_count,
                    requested: quantity,
                });
            }
            product.inventory_count -= quantity;
            Ok(product.inventory_count)
        }
    }
}
