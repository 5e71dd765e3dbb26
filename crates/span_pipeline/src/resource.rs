//! Service-identifying attributes attached to every exported batch.

use crate::span::AttributeValue;
use std::collections::BTreeMap;

pub const SERVICE_NAME: &str = "service.name";
pub const TELEMETRY_SDK_NAME: &str = "telemetry.sdk.name";
pub const TELEMETRY_SDK_LANGUAGE: &str = "telemetry.sdk.language";
pub const TELEMETRY_SDK_VERSION: &str = "telemetry.sdk.version";

/// Immutable set of resource attributes, shared by the pipeline as `Arc<Resource>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    /// Builds the resource for `service_name` together with the SDK identity attributes.
    pub fn new(service_name: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(SERVICE_NAME.to_owned(), AttributeValue::String(service_name.into()));
        attributes.insert(
            TELEMETRY_SDK_NAME.to_owned(),
            AttributeValue::from(env!("CARGO_PKG_NAME")),
        );
        attributes.insert(TELEMETRY_SDK_LANGUAGE.to_owned(), AttributeValue::from("rust"));
        attributes.insert(
            TELEMETRY_SDK_VERSION.to_owned(),
            AttributeValue::from(env!("CARGO_PKG_VERSION")),
        );
        Self { attributes }
    }

    /// An empty resource with no attributes at all.
    pub fn empty() -> Self {
        Self {
            attributes: BTreeMap::new(),
        }
    }

    /// Adds or replaces an attribute. Consumes `self`; a resource is never
    /// modified once the pipeline owns it.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn service_name(&self) -> Option<&str> {
        match self.attributes.get(SERVICE_NAME) {
            Some(AttributeValue::String(name)) => Some(name),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_carries_service_and_sdk_identity() {
        let resource = Resource::new("checkout");
        assert_eq!(resource.service_name(), Some("checkout"));
        assert_eq!(resource.get(TELEMETRY_SDK_LANGUAGE), Some(&AttributeValue::from("rust")));
        assert!(resource.get(TELEMETRY_SDK_VERSION).is_some());
        assert_eq!(resource.len(), 4);
    }

    #[test]
    fn test_with_attribute_overrides() {
        let resource = Resource::new("a")
            .with_attribute("deployment.environment", "prod")
            .with_attribute(SERVICE_NAME, "b");
        assert_eq!(resource.service_name(), Some("b"));
        assert_eq!(
            resource.get("deployment.environment"),
            Some(&AttributeValue::from("prod"))
        );
    }

    #[test]
    fn test_empty_resource() {
        let resource = Resource::empty();
        assert!(resource.is_empty());
        assert_eq!(resource.service_name(), None);
    }
}
