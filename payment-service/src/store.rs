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
    #[error("payment not found")]
    NotFound,

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
pub trait PaymentStore: Send + Sync + 'static {
    async fn save(&self, payment: &Payment) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Payment, StoreError>;

    async fn set_gateway(&self, id: Uuid, gateway_name: &str) -> Result<(), StoreError>;

    async fn set_status(&self, id: Uuid, status: PaymentStatus) -> Result<(), StoreError>;
}

pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn save(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(payments::table)
            .values(payment)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Payment, StoreError> {
        let mut conn = self.pool.get().await?;
        payments::table
            .find(id)
            .first::<Payment>(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    async fn set_gateway(&self, id: Uuid, gateway_name: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(payments::table.find(id))
            .set(payments::gateway_name.eq(gateway_name))
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: PaymentStatus) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(payments::table.find(id))
            .set(payments::status.eq(status.as_str()))
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryPaymentStore {
        payments: Mutex<HashMap<Uuid, Payment>>,
    }

    impl MemoryPaymentStore {
        fn update(&self, id: Uuid, apply: impl FnOnce(&mut Payment)) -> Result<(), StoreError> {
            let mut payments = self.payments.lock().unwrap();
            apply(payments.get_mut(&id).ok_or(StoreError::NotFound)?);
            Ok(())
        }
    }

    #[async_trait]
    impl PaymentStore for MemoryPaymentStore {
        async fn save(&self, payment: &Payment) -> Result<(), StoreError> {
            self.payments.lock().unwrap().insert(payment.id, payment.clone());
            Ok(())
        }

        async fn get(&self, id: Uuid) -> Result<Payment, StoreError> {
            self.payments.lock().unwrap().get(&id).cloned().ok_or(StoreError::NotFound)
        }

        async fn set_gateway(&self, id: Uuid, gateway_name: &str) -> Result<(), StoreError> {
            self.update(id, |payment| payment.gateway_name = Some(gateway_name.to_string()))
        }

        async fn set_status(&self, id: Uuid, status: PaymentStatus) -> Result<(), StoreError> {
            self.update(id, |payment| payment.status = status.as_str().to_string())
        }
    }
}
