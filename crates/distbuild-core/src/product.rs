//! Products and their signing keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::task::{NewTask, TaskParent, TaskPayload};

/// A signing key generated for a community product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignKey {
    pub keyid: String,
    pub fingerprint: String,
    pub public_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOwner {
    pub username: String,
    pub email: String,
}

/// A product assembled from builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ResourceId,
    pub name: String,
    pub owner: ProductOwner,
    /// Only community products get generated signing keys.
    pub is_community: bool,
    pub sign_key: Option<SignKey>,
    /// Builds whose packages make up the product, oldest first.
    #[serde(default)]
    pub builds: Vec<ResourceId>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// A key generation request on behalf of the product owner.
    pub fn gen_key_task(&self) -> NewTask {
        NewTask::new(
            TaskParent::Product(self.id),
            TaskPayload::GenKey {
                product_name: self.name.clone(),
                user_name: self.owner.username.clone(),
                user_email: self.owner.email.clone(),
            },
        )
    }
}

/// Adding a build to a product, or taking it out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductChange {
    Add,
    Remove,
}

impl ProductChange {
    pub fn scheduled_message(self, build_id: ResourceId, product: &str) -> String {
        match self {
            ProductChange::Add => {
                format!("Build {} is being added to product {}", build_id, product)
            }
            ProductChange::Remove => {
                format!("Build {} is being removed from product {}", build_id, product)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub owner: ProductOwner,
    #[serde(default)]
    pub is_community: bool,
}

impl NewProduct {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::Validation(
                "product name must not be empty".to_string(),
            ));
        }
        if self.owner.username.trim().is_empty() {
            return Err(crate::Error::Validation(
                "product owner must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
