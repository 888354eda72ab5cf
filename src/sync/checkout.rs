//! Attaches a completed checkout to the local user.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLogger};
use crate::billing::{BillingGateway, CheckoutStatus};
use crate::entitlements::EntitlementStore;
use crate::error::{EntitlementError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLink {
    pub session_id: String,
    pub user_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Provider objects whose metadata could not be updated.
    pub metadata_failures: Vec<String>,
}

/// Tags the checkout's provider objects with the user's identity.
///
/// Only metadata is written. The local plan is set by the next sync, never here.
#[derive(Clone)]
pub struct CheckoutLinker {
    store: Arc<dyn EntitlementStore>,
    gateway: BillingGateway,
    audit: Arc<dyn AuditLogger>,
}

impl CheckoutLinker {
    pub fn new(store: Arc<dyn EntitlementStore>, gateway: BillingGateway, audit: Arc<dyn AuditLogger>) -> Self {
        Self { store, gateway, audit }
    }

    pub async fn link(&self, session_id: &str, user_id: &str) -> Result<CheckoutLink> {
        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        if session.status != CheckoutStatus::Complete {
            return Err(EntitlementError::invalid_state(format!(
                "checkout session {} is {}, nothing to link",
                session_id,
                session.status.as_str()
            )));
        }

        let metadata = self.metadata_for(user_id).await?;
        let mut failures = Vec::new();

        if let Err(e) = self
            .gateway
            .update_checkout_session_metadata(session_id, metadata.clone())
            .await
        {
            self.log_metadata_failure(user_id, session_id, &e);
            failures.push(session_id.to_string());
        }
        if let Some(customer_id) = &session.customer_id {
            if let Err(e) = self
                .gateway
                .update_customer_metadata(customer_id, metadata.clone())
                .await
            {
                self.log_metadata_failure(user_id, customer_id, &e);
                failures.push(customer_id.clone());
            }
        }
        if let Some(subscription_id) = &session.subscription_id {
            if let Err(e) = self
                .gateway
                .update_subscription_metadata(subscription_id, metadata)
                .await
            {
                self.log_metadata_failure(user_id, subscription_id, &e);
                failures.push(subscription_id.clone());
            }
        }

        self.audit
            .log(AuditEvent::CheckoutLinked {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            })
            .await;

        Ok(CheckoutLink {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            customer_id: session.customer_id,
            subscription_id: session.subscription_id,
            metadata_failures: failures,
        })
    }

    async fn metadata_for(&self, user_id: &str) -> Result<HashMap<String, String>> {
        let mut metadata = HashMap::from([("user_id".to_string(), user_id.to_string())]);
        if let Some(profile) = self.store.get_billing_profile(user_id).await? {
            metadata.insert("email".to_string(), profile.email);
            if let Some(name) = profile.full_name {
                metadata.insert("full_name".to_string(), name);
            }
        }
        Ok(metadata)
    }

    fn log_metadata_failure(&self, user_id: &str, object_id: &str, err: &EntitlementError) {
        tracing::warn!(
            target: "plansync::sync",
            user_id = %user_id,
            object_id = %object_id,
            error = %err,
            "Failed to update checkout metadata"
        );
    }
}
