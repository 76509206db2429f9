//! Per-resource-group template assembly.

use std::collections::{BTreeMap, HashMap};

use azclone_db::{DiscoveredResource, ResourceEdge};
use serde_json::{Map, Value, json};

use crate::emitters::{EmitContext, EmitterRegistry};
use crate::naming::{safe_name, storage_account_name};

const TEMPLATE_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";

const STORAGE_TYPE: &str = "microsoft.storage/storageaccounts";
const SQL_TYPE: &str = "microsoft.sql/servers";
const SITE_TYPE: &str = "microsoft.web/sites";
const PLAN_TYPE: &str = "microsoft.web/serverfarms";

/// One synthesized template with its deploy-time parameter values and the
/// highest dependency level it contains.
#[derive(Debug, Clone)]
pub struct GroupTemplate {
    pub resource_group: String,
    pub template: Value,
    pub parameters: Value,
    pub max_level: i32,
}

pub struct TemplateSynthesizer {
    registry: EmitterRegistry,
}

impl TemplateSynthesizer {
    pub fn new() -> Self {
        Self {
            registry: EmitterRegistry::new(),
        }
    }

    /// One template per resource group, groups in name order.
    pub fn synthesize_session(
        &self,
        resources: &[DiscoveredResource],
        edges: &[ResourceEdge],
    ) -> Vec<GroupTemplate> {
        let mut groups: BTreeMap<&str, Vec<&DiscoveredResource>> = BTreeMap::new();
        for resource in resources {
            groups
                .entry(resource.resource_group.as_str())
                .or_default()
                .push(resource);
        }
        groups
            .into_iter()
            .map(|(group, members)| self.synthesize_group(group, &members, edges))
            .collect()
    }

    pub fn synthesize_group(
        &self,
        resource_group: &str,
        resources: &[&DiscoveredResource],
        edges: &[ResourceEdge],
    ) -> GroupTemplate {
        // Deploy order inside the template follows the computed levels.
        let mut members: Vec<&DiscoveredResource> = resources.to_vec();
        members.sort_by(|a, b| {
            (a.dependency_level, &a.name).cmp(&(b.dependency_level, &b.name))
        });

        // Safe identifiers, disambiguated when two names collapse to the
        // same one.
        let mut taken: HashMap<String, u32> = HashMap::new();
        let mut safe_names: HashMap<&str, String> = HashMap::new();
        for resource in &members {
            let mut safe = safe_name(&resource.name);
            let count = taken.entry(safe.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                safe = format!("{}{}", safe, count);
            }
            safe_names.insert(resource.id.as_str(), safe);
        }

        // Same-group dependencies, keyed by source row id.
        let in_group: HashMap<&str, &DiscoveredResource> =
            members.iter().map(|r| (r.id.as_str(), *r)).collect();
        let mut group_edges: HashMap<&str, Vec<&ResourceEdge>> = HashMap::new();
        for edge in edges {
            if in_group.contains_key(edge.source_id.as_str())
                && in_group.contains_key(edge.target_id.as_str())
            {
                group_edges
                    .entry(edge.source_id.as_str())
                    .or_default()
                    .push(edge);
            }
        }

        let mut parameters = Map::new();
        let mut declarations = Vec::new();
        let mut outputs = Map::new();
        let mut has_sql = false;
        let mut needs_default_plan = false;

        for &resource in &members {
            let safe = safe_names[resource.id.as_str()].clone();
            let type_lower = resource.resource_type.to_ascii_lowercase();

            let default_name = if type_lower == STORAGE_TYPE {
                storage_account_name(&resource.name)
            } else {
                resource.name.clone()
            };
            parameters.insert(
                format!("{}Name", safe),
                json!({"type": "string", "defaultValue": default_name}),
            );
            parameters.insert(
                format!("{}Location", safe),
                json!({"type": "string", "defaultValue": resource.location}),
            );
            if type_lower == SQL_TYPE {
                has_sql = true;
            }

            let mut depends_on = Vec::new();
            let mut plan_reference = None;
            for edge in group_edges.get(resource.id.as_str()).into_iter().flatten() {
                let target = in_group[edge.target_id.as_str()];
                let target_safe = &safe_names[edge.target_id.as_str()];
                let expr = format!(
                    "[resourceId('{}', parameters('{}Name'))]",
                    target.resource_type, target_safe
                );
                if target.resource_type.eq_ignore_ascii_case(PLAN_TYPE) {
                    plan_reference = Some(expr.clone());
                }
                if !depends_on.contains(&expr) {
                    depends_on.push(expr);
                }
            }
            if type_lower == SITE_TYPE && plan_reference.is_none() {
                needs_default_plan = true;
            }

            declarations.push(self.registry.emit(&EmitContext {
                resource,
                safe: safe.clone(),
                depends_on,
                plan_reference,
            }));

            outputs.insert(
                format!("{}Id", safe),
                json!({
                    "type": "string",
                    "value": format!(
                        "[resourceId('{}', parameters('{}Name'))]",
                        resource.resource_type, safe
                    )
                }),
            );
        }

        let mut parameter_values = Map::new();
        if has_sql {
            parameters.insert(
                "sqlAdminPassword".to_string(),
                json!({"type": "securestring"}),
            );
            parameter_values.insert(
                "sqlAdminPassword".to_string(),
                json!({"value": generated_password()}),
            );
        }
        if needs_default_plan {
            parameters.insert(
                "defaultAppServicePlan".to_string(),
                json!({
                    "type": "string",
                    "defaultValue": format!("{}-plan", resource_group)
                }),
            );
        }

        let template = json!({
            "$schema": TEMPLATE_SCHEMA,
            "contentVersion": "1.0.0.0",
            "parameters": parameters,
            "variables": {"resourcePrefix": format!("{}-", resource_group)},
            "resources": declarations,
            "outputs": outputs,
        });

        GroupTemplate {
            resource_group: resource_group.to_string(),
            template,
            parameters: Value::Object(parameter_values),
            max_level: members.iter().map(|r| r.dependency_level).max().unwrap_or(0),
        }
    }
}

impl Default for TemplateSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh secret for the re-parameterized SQL administrator password. The
/// source secret is never available (secrets are not cloned), so every
/// session gets a new one.
fn generated_password() -> String {
    format!("Aa1!{}", uuid::Uuid::new_v4().simple())
}
