//! Template pre-validation.
//!
//! Catches template defects locally before spending a cloud round-trip:
//! missing schema, empty resource lists, storage accounts without a SKU,
//! access tiers on incompatible kinds, and read-only properties that ARM
//! rejects on submission.

use serde_json::Value;

/// Read-only properties that must never appear in a template.
pub const FORBIDDEN_PROPERTIES: [&str; 2] = ["provisioningState", "primaryLocation"];

const ACCESS_TIER_KINDS: [&str; 2] = ["StorageV2", "BlobStorage"];

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub target: Option<String>,
}

impl ValidationIssue {
    fn new(code: &str, message: impl Into<String>, target: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            target,
        }
    }
}

/// Inspect a generated template. An empty result means it may be sent to the
/// cloud.
pub fn prevalidate(template: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if template.get("$schema").and_then(Value::as_str).is_none() {
        issues.push(ValidationIssue::new(
            "MissingSchema",
            "template has no $schema declaration",
            None,
        ));
    }

    let resources = template.get("resources").and_then(Value::as_array);
    match resources {
        None => issues.push(ValidationIssue::new(
            "MissingResources",
            "template has no resources array",
            None,
        )),
        Some(list) if list.is_empty() => issues.push(ValidationIssue::new(
            "EmptyResources",
            "template declares no resources",
            None,
        )),
        Some(list) => {
            for resource in list {
                check_resource(resource, &mut issues);
            }
        }
    }

    issues
}

fn check_resource(resource: &Value, issues: &mut Vec<ValidationIssue>) {
    let name = resource
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let resource_type = resource.get("type").and_then(Value::as_str).unwrap_or("");

    if resource_type.eq_ignore_ascii_case("Microsoft.Storage/storageAccounts") {
        if resource.pointer("/sku/name").and_then(Value::as_str).is_none() {
            issues.push(ValidationIssue::new(
                "MissingStorageSku",
                "storage account declaration has no sku.name",
                Some(name.clone()),
            ));
        }
        let kind = resource.get("kind").and_then(Value::as_str).unwrap_or("");
        let has_tier = resource
            .pointer("/properties/accessTier")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if has_tier && !ACCESS_TIER_KINDS.iter().any(|k| k.eq_ignore_ascii_case(kind)) {
            issues.push(ValidationIssue::new(
                "InvalidAccessTier",
                format!("accessTier is not valid for storage kind '{}'", kind),
                Some(name.clone()),
            ));
        }
    }

    let mut forbidden = Vec::new();
    find_forbidden_keys(resource, &mut forbidden);
    for key in forbidden {
        issues.push(ValidationIssue::new(
            "ReadOnlyProperty",
            format!("read-only property '{}' must not be emitted", key),
            Some(name.clone()),
        ));
    }
}

fn find_forbidden_keys(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if FORBIDDEN_PROPERTIES.iter().any(|f| f.eq_ignore_ascii_case(key)) {
                    found.push(key.clone());
                }
                find_forbidden_keys(nested, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                find_forbidden_keys(item, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_template() -> Value {
        json!({
            "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#",
            "contentVersion": "1.0.0.0",
            "resources": [{
                "type": "Microsoft.Network/publicIPAddresses",
                "apiVersion": "2023-04-01",
                "name": "[parameters('pipName')]",
                "location": "[parameters('pipLocation')]",
                "properties": {"publicIPAllocationMethod": "Dynamic"}
            }]
        })
    }

    #[test]
    fn valid_template_passes() {
        assert!(prevalidate(&minimal_template()).is_empty());
    }

    #[test]
    fn missing_schema_is_reported() {
        let mut template = minimal_template();
        template.as_object_mut().unwrap().remove("$schema");
        let issues = prevalidate(&template);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "MissingSchema");
    }

    #[test]
    fn empty_resources_are_reported() {
        let mut template = minimal_template();
        template["resources"] = json!([]);
        assert_eq!(prevalidate(&template)[0].code, "EmptyResources");

        template.as_object_mut().unwrap().remove("resources");
        assert_eq!(prevalidate(&template)[0].code, "MissingResources");
    }

    #[test]
    fn storage_account_without_sku_is_reported() {
        let mut template = minimal_template();
        template["resources"] = json!([{
            "type": "Microsoft.Storage/storageAccounts",
            "apiVersion": "2023-01-01",
            "name": "stg01",
            "location": "eastus",
            "kind": "StorageV2",
            "properties": {}
        }]);
        let issues = prevalidate(&template);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "MissingStorageSku");
        assert_eq!(issues[0].target.as_deref(), Some("stg01"));
    }

    #[test]
    fn access_tier_requires_compatible_kind() {
        let mut template = minimal_template();
        template["resources"] = json!([{
            "type": "Microsoft.Storage/storageAccounts",
            "apiVersion": "2023-01-01",
            "name": "stg01",
            "location": "eastus",
            "kind": "Storage",
            "sku": {"name": "Standard_LRS"},
            "properties": {"accessTier": "Hot"}
        }]);
        let issues = prevalidate(&template);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "InvalidAccessTier");
    }

    #[test]
    fn read_only_properties_are_rejected_wherever_nested() {
        let mut template = minimal_template();
        template["resources"][0]["properties"] = json!({
            "publicIPAllocationMethod": "Static",
            "nested": [{"provisioningState": "Succeeded"}]
        });
        let issues = prevalidate(&template);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "ReadOnlyProperty");
        assert!(issues[0].message.contains("provisioningState"));
    }
}
