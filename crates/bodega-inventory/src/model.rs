//! Product model
//!
//! Products are plain values; the store hands out copies so callers can never
//! mutate a live row. Any mutation refreshes `updated_at` with wall-clock
//! milliseconds.

use serde::{Deserialize, Serialize};

use bodega_common::{is_valid_id, now_millis};

/// Derived stock level of a product
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    OutOfStock,
    LowStock,
    Overstocked,
    Normal,
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StockStatus::OutOfStock => write!(f, "OUT_OF_STOCK"),
            StockStatus::LowStock => write!(f, "LOW_STOCK"),
            StockStatus::Overstocked => write!(f, "OVERSTOCKED"),
            StockStatus::Normal => write!(f, "NORMAL"),
        }
    }
}

/// A product held by a branch
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub quantity: u32,
    pub min_stock: u32,
    pub updated_at: i64,
}

impl Product {
    pub fn new(
        product_id: &str,
        name: &str,
        description: &str,
        price: f64,
        quantity: u32,
        min_stock: u32,
    ) -> Self {
        Self {
            product_id: product_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            category: "General".to_string(),
            price,
            quantity,
            min_stock,
            updated_at: now_millis(),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.quantity == 0
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.min_stock
    }

    /// More than 3x the minimum stock level
    pub fn is_overstocked(&self) -> bool {
        self.quantity > self.min_stock * 3
    }

    pub fn stock_status(&self) -> StockStatus {
        if self.is_out_of_stock() {
            StockStatus::OutOfStock
        } else if self.is_low_stock() {
            StockStatus::LowStock
        } else if self.is_overstocked() {
            StockStatus::Overstocked
        } else {
            StockStatus::Normal
        }
    }

    /// Units needed to reach the optimal level of 2x minimum stock
    pub fn replenishment_needed(&self) -> u32 {
        (self.min_stock * 2).saturating_sub(self.quantity)
    }

    pub fn stock_value(&self) -> f64 {
        f64::from(self.quantity) * self.price
    }

    /// Reduce quantity for a sale or outgoing transfer
    ///
    /// Fails without mutating when the stock is insufficient or the amount
    /// is zero.
    pub fn reduce_quantity(&mut self, amount: u32) -> bool {
        if amount == 0 || self.quantity < amount {
            return false;
        }
        self.quantity -= amount;
        self.touch();
        true
    }

    /// Add quantity for a restock or incoming transfer
    pub fn add_quantity(&mut self, amount: u32) {
        self.quantity += amount;
        self.touch();
    }

    pub fn is_valid(&self) -> bool {
        is_valid_id(&self.product_id)
            && !self.name.trim().is_empty()
            && self.price.is_finite()
            && self.price >= 0.0
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Product{{id={}, name={}, qty={}, price={:.2}, status={:?}}}",
            self.product_id,
            self.name,
            self.quantity,
            self.price,
            self.stock_status()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laptop() -> Product {
        Product::new("P001", "Laptop", "High-performance laptop", 999.99, 10, 3)
            .with_category("Electronics")
    }

    #[test]
    fn test_stock_status_thresholds() {
        let mut p = laptop();
        assert_eq!(p.stock_status(), StockStatus::Overstocked); // 10 > 3 * 3

        p.quantity = 5;
        assert_eq!(p.stock_status(), StockStatus::Normal);

        p.quantity = 3;
        assert_eq!(p.stock_status(), StockStatus::LowStock);

        p.quantity = 0;
        assert_eq!(p.stock_status(), StockStatus::OutOfStock);
    }

    #[test]
    fn test_replenishment_needed() {
        let mut p = laptop();
        p.min_stock = 3;
        p.quantity = 2;
        assert_eq!(p.replenishment_needed(), 4);

        p.quantity = 6;
        assert_eq!(p.replenishment_needed(), 0);

        p.quantity = 10;
        assert_eq!(p.replenishment_needed(), 0);
    }

    #[test]
    fn test_reduce_quantity_checks_stock() {
        let mut p = laptop();
        assert!(p.reduce_quantity(4));
        assert_eq!(p.quantity, 6);

        assert!(!p.reduce_quantity(7));
        assert_eq!(p.quantity, 6);

        assert!(!p.reduce_quantity(0));
    }

    #[test]
    fn test_validation() {
        assert!(laptop().is_valid());

        let mut p = laptop();
        p.product_id = "".to_string();
        assert!(!p.is_valid());

        let mut p = laptop();
        p.name = "   ".to_string();
        assert!(!p.is_valid());

        let mut p = laptop();
        p.price = -1.0;
        assert!(!p.is_valid());
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = laptop();
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("productId"));
        assert!(json.contains("minStock"));

        let decoded: Product = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.product_id, p.product_id);
        assert_eq!(decoded.quantity, p.quantity);
    }
}
