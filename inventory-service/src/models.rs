use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::InventoryRecord;

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub info: String,
    pub inventory_count: i32,
    pub price: f64,
}

/// Fields a client supplies when creating or replacing a product.
#[derive(Debug, Clone, PartialEq, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct ProductFields {
    pub name: String,
    #[serde(default = "default_info")]
    pub info: String,
    pub inventory_count: i32,
    pub price: f64,
}

fn default_info() -> String {
    "no info added".to_string()
}

impl ProductFields {
    pub fn into_product(self, id: String) -> Product {
        Product {
            id,
            name: self.name,
            info: self.info,
            inventory_count: self.inventory_count,
            price: self.price,
        }
    }
}

impl From<Product> for InventoryRecord {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            name: product.name,
            info: product.info,
            inventory_count: product.inventory_count,
            price: product.price,
        }
    }
}
