//! Customer records consulted during triage

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A customer account and its support plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub name: String,
    pub email: String,
    pub plan: String,
    pub support_entitlement: bool,
}

/// What the customer runs, used by the expert analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub environment: String,
    pub runtime_version: String,
    pub cloud_provider: String,
    pub components: Vec<String>,
}

/// Read-only lookup of customers and their systems
#[derive(Debug, Clone, Default)]
pub struct CustomerDirectory {
    customers: HashMap<String, (Customer, Option<SystemInfo>)>,
}

impl CustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded with the demo accounts
    ///
    /// `CUST001` and `CUST002` are entitled to support, `CUST003` is not.
    pub fn with_sample_data() -> Self {
        let mut directory = Self::new();
        directory
            .insert(
                Customer {
                    customer_id: "CUST001".to_string(),
                    name: "Acme Corporation".to_string(),
                    email: "support@acme.com".to_string(),
                    plan: "Enterprise".to_string(),
                    support_entitlement: true,
                },
                Some(SystemInfo {
                    environment: "Production".to_string(),
                    runtime_version: "1.12.0".to_string(),
                    cloud_provider: "Azure".to_string(),
                    components: vec![
                        "state:redis".to_string(),
                        "pubsub:servicebus".to_string(),
                        "bindings:storage".to_string(),
                    ],
                }),
            )
            .insert(
                Customer {
                    customer_id: "CUST002".to_string(),
                    name: "TechStart Inc".to_string(),
                    email: "help@techstart.com".to_string(),
                    plan: "Professional".to_string(),
                    support_entitlement: true,
                },
                Some(SystemInfo {
                    environment: "Staging".to_string(),
                    runtime_version: "1.11.5".to_string(),
                    cloud_provider: "AWS".to_string(),
                    components: vec!["state:dynamodb".to_string(), "pubsub:sns".to_string()],
                }),
            )
            .insert(
                Customer {
                    customer_id: "CUST003".to_string(),
                    name: "Basic User LLC".to_string(),
                    email: "user@basicuser.com".to_string(),
                    plan: "Basic".to_string(),
                    support_entitlement: false,
                },
                None,
            );
        directory
    }

    pub fn insert(&mut self, customer: Customer, system: Option<SystemInfo>) -> &mut Self {
        self.customers
            .insert(customer.customer_id.clone(), (customer, system));
        self
    }

    pub fn customer(&self, customer_id: &str) -> Option<&Customer> {
        self.customers.get(customer_id).map(|(customer, _)| customer)
    }

    pub fn system_info(&self, customer_id: &str) -> Option<&SystemInfo> {
        self.customers
            .get(customer_id)
            .and_then(|(_, system)| system.as_ref())
    }

    /// All customers with their systems, ordered by customer id
    pub fn entries(&self) -> Vec<(&Customer, Option<&SystemInfo>)> {
        let mut entries: Vec<_> = self
            .customers
            .values()
            .map(|(customer, system)| (customer, system.as_ref()))
            .collect();
        entries.sort_by(|a, b| a.0.customer_id.cmp(&b.0.customer_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_entitlements() {
        let directory = CustomerDirectory::with_sample_data();
        assert!(directory.customer("CUST001").unwrap().support_entitlement);
        assert!(directory.customer("CUST002").unwrap().support_entitlement);
        assert!(!directory.customer("CUST003").unwrap().support_entitlement);
        assert!(directory.customer("CUST999").is_none());
    }

    #[test]
    fn test_system_info_is_optional() {
        let directory = CustomerDirectory::with_sample_data();
        assert_eq!(
            directory.system_info("CUST001").unwrap().environment,
            "Production"
        );
        assert!(directory.system_info("CUST003").is_none());
    }

    #[test]
    fn test_entries_are_ordered() {
        let directory = CustomerDirectory::with_sample_data();
        let ids: Vec<_> = directory
            .entries()
            .into_iter()
            .map(|(customer, _)| customer.customer_id.as_str())
            .collect();
        assert_eq!(ids, vec!["CUST001", "CUST002", "CUST003"]);
    }
}
