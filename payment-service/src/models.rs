use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(anyhow::anyhow!("unknown payment status {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct Payment {
    pub id: Uuid,
    pub product_id: String,
    pub purchase_time: DateTime<Utc>,
    pub quantity: i32,
    pub total_price: BigDecimal,
    pub status: String,
    pub gateway_name: Option<String>,
}

impl Payment {
    /// A new pending payment for `quantity` units at `unit_price` each.
    pub fn pending(product_id: impl Into<String>, quantity: i32, unit_price: f64) -> anyhow::Result<Self> {
        let unit_price = BigDecimal::from_f64(unit_price)
            .ok_or_else(|| anyhow::anyhow!("invalid unit price {}", unit_price))?;

        Ok(Self {
            id: Uuid::new_v4(),
            product_id: product_id.into(),
            purchase_time: Utc::now(),
            quantity,
            total_price: (unit_price * BigDecimal::from(quantity)).round(2),
            status: PaymentStatus::Pending.as_str().to_string(),
            gateway_name: None,
        })
    }

    pub fn status(&self) -> anyhow::Result<PaymentStatus> {
        self.status.parse()
    }
}

/// What the status endpoint returns for a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentView {
    pub id: Uuid,
    pub product_id: String,
    pub purchase_time: DateTime<Utc>,
    pub quantity: i32,
    pub total_price: f64,
    pub status: String,
    pub gateway_name: Option<String>,
}

impl From<Payment> for PaymentView {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            product_id: payment.product_id,
            purchase_time: payment.purchase_time,
            quantity: payment.quantity,
            total_price: payment.total_price.to_f64().unwrap_or_default(),
            status: payment.status,
            gateway_name: payment.gateway_name,
        }
    }
}
