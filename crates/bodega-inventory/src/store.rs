//! Thread-safe inventory store for a branch
//!
//! Readers run in parallel, writers are exclusive, and every public method is
//! atomic with respect to the store's own state. All accessors return copies.

use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicI64, Ordering},
    },
};

use tracing::{debug, info};

use bodega_common::now_millis;

use crate::model::Product;

#[derive(Debug, Default)]
struct Counters {
    transactions: u64,
    items_sold: u64,
    items_received: u64,
}

/// Snapshot of inventory statistics
#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryStats {
    pub transactions: u64,
    pub items_sold: u64,
    pub items_received: u64,
    pub product_count: usize,
    pub total_value: f64,
}

/// Per-branch product catalogue with read/write exclusion
pub struct InventoryStore {
    branch_id: String,
    products: RwLock<HashMap<String, Product>>,
    counters: Mutex<Counters>,
    last_modified: AtomicI64,
}

impl InventoryStore {
    pub fn new(branch_id: &str) -> Self {
        Self {
            branch_id: branch_id.to_string(),
            products: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            last_modified: AtomicI64::new(now_millis()),
        }
    }

    /// Add a new product
    ///
    /// Fails when the product is invalid or the id is already present;
    /// overwriting requires an explicit `update`.
    pub fn add(&self, product: Product) -> bool {
        if !product.is_valid() {
            return false;
        }

        let mut products = self.write_products();
        if products.contains_key(&product.product_id) {
            return false;
        }

        debug!(product_id = %product.product_id, "Added product to inventory");
        products.insert(product.product_id.clone(), product);
        drop(products);

        self.record_mutation(0, 0);
        true
    }

    /// Replace an existing product row
    pub fn update(&self, product: Product) -> bool {
        if !product.is_valid() {
            return false;
        }

        let mut products = self.write_products();
        if !products.contains_key(&product.product_id) {
            return false;
        }

        products.insert(product.product_id.clone(), product);
        drop(products);

        self.record_mutation(0, 0);
        true
    }

    /// Remove a product (admin delete)
    pub fn remove(&self, product_id: &str) -> bool {
        let removed = self.write_products().remove(product_id).is_some();
        if removed {
            self.record_mutation(0, 0);
        }
        removed
    }

    /// Get a product by id (defensive copy)
    pub fn get(&self, product_id: &str) -> Option<Product> {
        self.read_products().get(product_id).cloned()
    }

    /// All products (copies, unspecified order)
    pub fn list(&self) -> Vec<Product> {
        self.read_products().values().cloned().collect()
    }

    pub fn products_by_category(&self, category: &str) -> Vec<Product> {
        self.products_where(|p| p.category == category)
    }

    pub fn products_where<F>(&self, predicate: F) -> Vec<Product>
    where
        F: Fn(&Product) -> bool,
    {
        self.read_products()
            .values()
            .filter(|p| predicate(p))
            .cloned()
            .collect()
    }

    /// Products at or below their minimum stock level
    pub fn low_stock(&self) -> Vec<Product> {
        self.products_where(Product::is_low_stock)
    }

    pub fn out_of_stock(&self) -> Vec<Product> {
        self.products_where(Product::is_out_of_stock)
    }

    pub fn overstocked(&self) -> Vec<Product> {
        self.products_where(Product::is_overstocked)
    }

    /// Search by id, name or description, case-insensitive
    pub fn search(&self, term: &str) -> Vec<Product> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Vec::new();
        }
        self.products_where(|p| {
            p.product_id.to_lowercase().contains(&term)
                || p.name.to_lowercase().contains(&term)
                || p.description.to_lowercase().contains(&term)
        })
    }

    /// Set an absolute quantity; statistics are updated by the delta sign
    pub fn update_qty(&self, product_id: &str, new_quantity: u32) -> bool {
        let mut products = self.write_products();
        let Some(product) = products.get_mut(product_id) else {
            return false;
        };

        let old = product.quantity;
        product.quantity = new_quantity;
        product.touch();
        drop(products);

        if new_quantity >= old {
            self.record_mutation(0, u64::from(new_quantity - old));
        } else {
            self.record_mutation(u64::from(old - new_quantity), 0);
        }
        true
    }

    pub fn update_price(&self, product_id: &str, new_price: f64) -> bool {
        if !new_price.is_finite() || new_price < 0.0 {
            return false;
        }

        let mut products = self.write_products();
        let Some(product) = products.get_mut(product_id) else {
            return false;
        };
        product.price = new_price;
        product.touch();
        drop(products);

        self.record_mutation(0, 0);
        true
    }

    /// Decrement stock for a sale; fails when the stock is insufficient
    pub fn reduce(&self, product_id: &str, quantity: u32) -> bool {
        let mut products = self.write_products();
        let ok = products
            .get_mut(product_id)
            .is_some_and(|p| p.reduce_quantity(quantity));
        drop(products);

        if ok {
            self.record_mutation(u64::from(quantity), 0);
        }
        ok
    }

    /// Increment stock for a restock delivery
    pub fn add_stock(&self, product_id: &str, quantity: u32) -> bool {
        if quantity == 0 {
            return false;
        }

        let mut products = self.write_products();
        let Some(product) = products.get_mut(product_id) else {
            return false;
        };
        product.add_quantity(quantity);
        drop(products);

        self.record_mutation(0, u64::from(quantity));
        true
    }

    /// Debit stock leaving this branch for `to_branch`
    pub fn transfer_out(&self, product_id: &str, quantity: u32, to_branch: &str) -> bool {
        let mut products = self.write_products();
        let ok = products
            .get_mut(product_id)
            .is_some_and(|p| p.reduce_quantity(quantity));
        drop(products);

        if ok {
            self.record_mutation(u64::from(quantity), 0);
            info!(
                product_id,
                quantity,
                to_branch,
                from_branch = %self.branch_id,
                "Transferred stock out"
            );
        }
        ok
    }

    /// Credit stock arriving from another branch
    pub fn receive(&self, product_id: &str, quantity: u32) -> bool {
        if quantity == 0 {
            return false;
        }

        let mut products = self.write_products();
        let Some(product) = products.get_mut(product_id) else {
            return false;
        };
        product.add_quantity(quantity);
        drop(products);

        self.record_mutation(0, u64::from(quantity));
        info!(product_id, quantity, branch = %self.branch_id, "Received stock transfer");
        true
    }

    pub fn has_product(&self, product_id: &str) -> bool {
        self.read_products().contains_key(product_id)
    }

    pub fn product_count(&self) -> usize {
        self.read_products().len()
    }

    pub fn total_value(&self) -> f64 {
        self.read_products().values().map(Product::stock_value).sum()
    }

    /// Product id to quantity map
    pub fn stock_summary(&self) -> HashMap<String, u32> {
        self.read_products()
            .iter()
            .map(|(id, p)| (id.clone(), p.quantity))
            .collect()
    }

    /// Aggregate quantity per category
    pub fn category_summary(&self) -> HashMap<String, u32> {
        let mut summary: HashMap<String, u32> = HashMap::new();
        for product in self.read_products().values() {
            *summary.entry(product.category.clone()).or_insert(0) += product.quantity;
        }
        summary
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> InventoryStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        InventoryStats {
            transactions: counters.transactions,
            items_sold: counters.items_sold,
            items_received: counters.items_received,
            product_count: self.product_count(),
            total_value: self.total_value(),
        }
    }

    pub fn reset_stats(&self) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters = Counters::default();
    }

    fn record_mutation(&self, sold: u64, received: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.transactions += 1;
        counters.items_sold += sold;
        counters.items_received += received;
        drop(counters);

        self.last_modified.store(now_millis(), Ordering::Relaxed);
    }

    fn read_products(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Product>> {
        self.products.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_products(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Product>> {
        self.products.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for InventoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryStore")
            .field("branch_id", &self.branch_id)
            .field("product_count", &self.product_count())
            .field("last_modified", &self.last_modified())
            .finish()
    }
}
