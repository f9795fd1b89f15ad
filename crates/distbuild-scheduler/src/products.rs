//! Products: signing key generation and assembly from builds.

use std::sync::Arc;

use chrono::Utc;
use distbuild_core::product::{NewProduct, Product, ProductChange};
use distbuild_core::task::{Task, TaskStatus};
use distbuild_core::{Error, ResourceId, Result};
use distbuild_db::{ProductRepo, TaskStore};
use tracing::info;

use crate::background::{BackgroundJob, BackgroundQueue};

pub struct ProductService {
    products: Arc<dyn ProductRepo>,
    store: Arc<dyn TaskStore>,
    queue: BackgroundQueue,
}

impl ProductService {
    pub fn new(
        products: Arc<dyn ProductRepo>,
        store: Arc<dyn TaskStore>,
        queue: BackgroundQueue,
    ) -> Self {
        Self {
            products,
            store,
            queue,
        }
    }

    /// Create a product and queue generation of its signing key, in one
    /// unit of work.
    pub async fn create_product(&self, product: &NewProduct) -> Result<(Product, Task)> {
        product.validate()?;
        let (created, task) = self.products.create(product, Utc::now()).await?;
        info!(
            product_id = %created.id,
            name = %created.name,
            task_id = %task.id,
            "Created product"
        );
        Ok((created, task))
    }

    pub async fn get_product(&self, id: ResourceId) -> Result<Product> {
        Ok(self.products.get(id).await?)
    }

    /// Queue another key generation for a community product.
    pub async fn create_gen_key_task(&self, product_id: ResourceId) -> Result<Task> {
        let product = self.products.get(product_id).await?;
        if !product.is_community {
            return Err(Error::Validation(format!(
                "Product \"{}\" is not community and you cannot generate sign key for one",
                product.name
            )));
        }
        let task = self
            .store
            .create_task(product.gen_key_task(), Utc::now())
            .await?;
        info!(task_id = %task.id, product_id = %product.id, "Created key generation task");
        Ok(task)
    }

    /// Check the request and schedule adding a build to, or removing it
    /// from, the named product.
    pub async fn modify_product(
        &self,
        build_id: ResourceId,
        product_name: &str,
        change: ProductChange,
    ) -> Result<String> {
        let product = self.products.get_by_name(product_name).await?;
        let build = self.store.get_build(build_id).await?;

        let present = product.builds.contains(&build_id);
        match change {
            ProductChange::Add if present => {
                return Err(Error::Validation(format!(
                    "Build {} is already in product {}",
                    build_id, product.name
                )));
            }
            ProductChange::Add if build.build.cancelled => {
                return Err(Error::Validation(format!(
                    "Build {} is cancelled and cannot be added to a product",
                    build_id
                )));
            }
            ProductChange::Add if !build.tasks.iter().any(|t| t.status == TaskStatus::Done) => {
                return Err(Error::Validation(format!(
                    "Build {} has no finished tasks to add",
                    build_id
                )));
            }
            ProductChange::Remove if !present => {
                return Err(Error::Validation(format!(
                    "Build {} is not in product {}",
                    build_id, product.name
                )));
            }
            _ => {}
        }

        self.queue
            .enqueue(BackgroundJob::ModifyProduct {
                product_id: product.id,
                build_id,
                change,
            })
            .await?;
        Ok(change.scheduled_message(build_id, &product.name))
    }

    /// Delete a product. Refused while its key generation is in flight.
    pub async fn remove_product(&self, product_id: ResourceId) -> Result<String> {
        self.products.remove(product_id).await?;
        Ok(format!("Product with product_id={} successfully removed", product_id))
    }
}

/// Applies scheduled product changes. Runs on the background worker.
pub struct ProductAssembler {
    products: Arc<dyn ProductRepo>,
}

impl ProductAssembler {
    pub fn new(products: Arc<dyn ProductRepo>) -> Self {
        Self { products }
    }

    pub async fn apply(
        &self,
        product_id: ResourceId,
        build_id: ResourceId,
        change: ProductChange,
    ) -> Result<bool> {
        let changed = self
            .products
            .change_builds(product_id, build_id, change, Utc::now())
            .await?;
        info!(
            product_id = %product_id,
            build_id = %build_id,
            ?change,
            changed,
            "Applied product change"
        );
        Ok(changed)
    }
}
