//! Type-aware resource declaration emitters.
//!
//! Each emitter turns one discovered resource into its ARM declaration.
//! Emitters re-shape rather than copy: read-only properties are dropped,
//! secrets are re-parameterized, and anything the source doesn't specify
//! falls back to a conservative default. A generic emitter covers types
//! without a dedicated one.

use std::collections::HashMap;

use azclone_core::azure::AzureResourceId;
use azclone_db::DiscoveredResource;
use serde_json::{Map, Value, json};

use crate::validate::FORBIDDEN_PROPERTIES;

const DEFAULT_API_VERSION: &str = "2021-04-01";

/// Per-type API versions for emitted declarations.
pub(crate) fn api_version_for(resource_type: &str) -> &'static str {
    match resource_type.to_ascii_lowercase().as_str() {
        "microsoft.storage/storageaccounts" => "2023-01-01",
        "microsoft.network/virtualnetworks" => "2023-04-01",
        "microsoft.network/networksecuritygroups" => "2023-04-01",
        "microsoft.network/publicipaddresses" => "2023-04-01",
        "microsoft.network/networkinterfaces" => "2023-04-01",
        "microsoft.compute/virtualmachines" => "2023-03-01",
        "microsoft.web/serverfarms" => "2022-09-01",
        "microsoft.web/sites" => "2022-09-01",
        "microsoft.sql/servers" => "2021-11-01",
        "microsoft.documentdb/databaseaccounts" => "2023-04-15",
        "microsoft.servicebus/namespaces" => "2021-11-01",
        "microsoft.keyvault/vaults" => "2023-02-01",
        _ => DEFAULT_API_VERSION,
    }
}

/// Everything an emitter needs to declare one resource.
pub struct EmitContext<'a> {
    pub resource: &'a DiscoveredResource,
    /// Safe identifier backing the `<safe>Name` / `<safe>Location`
    /// parameters.
    pub safe: String,
    /// `resourceId()` expressions for same-group dependencies.
    pub depends_on: Vec<String>,
    /// ARM expression for a web app's plan when the plan is part of the
    /// group; `None` falls back to the shared default-plan parameter.
    pub plan_reference: Option<String>,
}

impl EmitContext<'_> {
    pub fn name_expr(&self) -> String {
        format!("[parameters('{}Name')]", self.safe)
    }

    pub fn location_expr(&self) -> String {
        format!("[parameters('{}Location')]", self.safe)
    }
}

pub trait ResourceEmitter: Send + Sync {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value;
}

/// Shared scaffolding: type, apiVersion, parameterized name and location,
/// dependsOn, tags.
fn base_declaration(ctx: &EmitContext<'_>) -> Map<String, Value> {
    let mut decl = Map::new();
    decl.insert("type".into(), json!(ctx.resource.resource_type));
    decl.insert(
        "apiVersion".into(),
        json!(api_version_for(&ctx.resource.resource_type)),
    );
    decl.insert("name".into(), json!(ctx.name_expr()));
    decl.insert("location".into(), json!(ctx.location_expr()));
    if !ctx.depends_on.is_empty() {
        decl.insert("dependsOn".into(), json!(ctx.depends_on));
    }
    if let Some(tags) = ctx.resource.tags.as_object() {
        if !tags.is_empty() {
            decl.insert("tags".into(), ctx.resource.tags.clone());
        }
    }
    decl
}

/// Insert `sku`/`identity`/`plan`-style blocks only when present and
/// non-empty.
fn insert_if_present(decl: &mut Map<String, Value>, key: &str, value: &Option<Value>) {
    if let Some(value) = value {
        let empty = value.is_null() || value.as_object().is_some_and(|o| o.is_empty());
        if !empty {
            decl.insert(key.to_string(), value.clone());
        }
    }
}

fn prop_str<'v>(resource: &'v DiscoveredResource, pointer: &str) -> Option<&'v str> {
    resource.properties.pointer(pointer).and_then(Value::as_str)
}

fn prop_array<'v>(resource: &'v DiscoveredResource, pointer: &str) -> &'v [Value] {
    resource
        .properties
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Literal `resourceId()` expression for a referenced sibling resource.
fn resource_id_expr(resource_type: &str, name: &str) -> String {
    format!("[resourceId('{}', '{}')]", resource_type, name)
}

/// Reference a subnet through its owning vnet.
fn subnet_reference(subnet_id: &str) -> Option<String> {
    let parsed = AzureResourceId::parse(subnet_id)?;
    if parsed.segments.len() != 2 {
        return None;
    }
    Some(format!(
        "[resourceId('Microsoft.Network/virtualNetworks/subnets', '{}', '{}')]",
        parsed.segments[0].1, parsed.segments[1].1
    ))
}

/// Deep copy with the read-only properties removed.
fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| {
                    !FORBIDDEN_PROPERTIES.iter().any(|f| f.eq_ignore_ascii_case(key))
                })
                .map(|(key, nested)| (key.clone(), sanitize(nested)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

pub struct StorageAccountEmitter;

impl ResourceEmitter for StorageAccountEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);

        let sku = ctx
            .resource
            .sku
            .clone()
            .filter(|s| s.pointer("/name").is_some())
            .unwrap_or_else(|| json!({"name": "Standard_LRS"}));
        decl.insert("sku".into(), sku);

        let kind = ctx.resource.kind.clone().unwrap_or_else(|| "StorageV2".into());
        decl.insert("kind".into(), json!(kind));

        let mut properties = Map::new();
        if kind == "StorageV2" || kind == "BlobStorage" {
            let tier = prop_str(ctx.resource, "/accessTier").unwrap_or("Hot");
            properties.insert("accessTier".into(), json!(tier));
        }
        properties.insert("supportsHttpsTrafficOnly".into(), json!(true));
        if let Some(tls) = prop_str(ctx.resource, "/minimumTlsVersion") {
            properties.insert("minimumTlsVersion".into(), json!(tls));
        }
        decl.insert("properties".into(), Value::Object(properties));

        Value::Object(decl)
    }
}

pub struct VirtualNetworkEmitter;

impl ResourceEmitter for VirtualNetworkEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);

        let address_space = ctx
            .resource
            .properties
            .pointer("/addressSpace")
            .cloned()
            .unwrap_or_else(|| json!({"addressPrefixes": ["10.0.0.0/16"]}));

        let subnets: Vec<Value> = prop_array(ctx.resource, "/subnets")
            .iter()
            .filter_map(|subnet| {
                let name = subnet.get("name").and_then(Value::as_str)?;
                let prefix = subnet
                    .pointer("/properties/addressPrefix")
                    .and_then(Value::as_str)
                    .unwrap_or("10.0.0.0/24");
                Some(json!({"name": name, "properties": {"addressPrefix": prefix}}))
            })
            .collect();

        decl.insert(
            "properties".into(),
            json!({"addressSpace": address_space, "subnets": subnets}),
        );
        Value::Object(decl)
    }
}

pub struct NetworkSecurityGroupEmitter;

impl ResourceEmitter for NetworkSecurityGroupEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);

        const RULE_FIELDS: [&str; 8] = [
            "protocol",
            "sourcePortRange",
            "destinationPortRange",
            "sourceAddressPrefix",
            "destinationAddressPrefix",
            "access",
            "priority",
            "direction",
        ];
        let rules: Vec<Value> = prop_array(ctx.resource, "/securityRules")
            .iter()
            .filter_map(|rule| {
                let name = rule.get("name").and_then(Value::as_str)?;
                let mut properties = Map::new();
                for field in RULE_FIELDS {
                    if let Some(value) = rule.pointer(&format!("/properties/{}", field)) {
                        properties.insert(field.to_string(), value.clone());
                    }
                }
                Some(json!({"name": name, "properties": properties}))
            })
            .collect();

        decl.insert("properties".into(), json!({"securityRules": rules}));
        Value::Object(decl)
    }
}

pub struct PublicIpEmitter;

impl ResourceEmitter for PublicIpEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        insert_if_present(&mut decl, "sku", &ctx.resource.sku);
        let method = prop_str(ctx.resource, "/publicIPAllocationMethod").unwrap_or("Dynamic");
        decl.insert(
            "properties".into(),
            json!({"publicIPAllocationMethod": method}),
        );
        Value::Object(decl)
    }
}

pub struct NetworkInterfaceEmitter;

impl ResourceEmitter for NetworkInterfaceEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);

        let ip_configurations: Vec<Value> = prop_array(ctx.resource, "/ipConfigurations")
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let name = config
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| format!("ipconfig{}", index + 1));
                let mut properties = Map::new();
                properties.insert("privateIPAllocationMethod".into(), json!("Dynamic"));
                if let Some(reference) = config
                    .pointer("/properties/subnet/id")
                    .and_then(Value::as_str)
                    .and_then(subnet_reference)
                {
                    properties.insert("subnet".into(), json!({"id": reference}));
                }
                if let Some(pip) = config
                    .pointer("/properties/publicIPAddress/id")
                    .and_then(Value::as_str)
                    .and_then(AzureResourceId::parse)
                {
                    properties.insert(
                        "publicIPAddress".into(),
                        json!({"id": resource_id_expr(
                            "Microsoft.Network/publicIPAddresses",
                            pip.name(),
                        )}),
                    );
                }
                json!({"name": name, "properties": properties})
            })
            .collect();

        decl.insert(
            "properties".into(),
            json!({"ipConfigurations": ip_configurations}),
        );
        Value::Object(decl)
    }
}

pub struct VirtualMachineEmitter;

impl ResourceEmitter for VirtualMachineEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        insert_if_present(&mut decl, "identity", &ctx.resource.identity);

        let vm_size = prop_str(ctx.resource, "/hardwareProfile/vmSize").unwrap_or("Standard_B2s");
        let image_reference = ctx
            .resource
            .properties
            .pointer("/storageProfile/imageReference")
            .filter(|v| v.get("publisher").is_some())
            .cloned()
            .unwrap_or_else(|| {
                json!({
                    "publisher": "Canonical",
                    "offer": "0001-com-ubuntu-server-jammy",
                    "sku": "22_04-lts-gen2",
                    "version": "latest"
                })
            });
        let admin_username =
            prop_str(ctx.resource, "/osProfile/adminUsername").unwrap_or("azureadmin");

        let nics: Vec<Value> = prop_array(ctx.resource, "/networkProfile/networkInterfaces")
            .iter()
            .filter_map(|nic| {
                let parsed = AzureResourceId::parse(nic.get("id")?.as_str()?)?;
                Some(json!({"id": resource_id_expr(
                    "Microsoft.Network/networkInterfaces",
                    parsed.name(),
                )}))
            })
            .collect();

        decl.insert(
            "properties".into(),
            json!({
                "hardwareProfile": {"vmSize": vm_size},
                "storageProfile": {
                    "imageReference": image_reference,
                    "osDisk": {
                        "createOption": "FromImage",
                        "managedDisk": {"storageAccountType": "Standard_LRS"}
                    }
                },
                "osProfile": {
                    "computerName": ctx.resource.name,
                    "adminUsername": admin_username
                },
                "networkProfile": {"networkInterfaces": nics}
            }),
        );
        Value::Object(decl)
    }
}

pub struct AppServicePlanEmitter;

impl ResourceEmitter for AppServicePlanEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        let sku = ctx
            .resource
            .sku
            .clone()
            .filter(|s| s.pointer("/name").is_some())
            .unwrap_or_else(|| json!({"name": "B1", "tier": "Basic"}));
        decl.insert("sku".into(), sku);

        let reserved = ctx
            .resource
            .properties
            .pointer("/reserved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        decl.insert("properties".into(), json!({"reserved": reserved}));
        Value::Object(decl)
    }
}

pub struct WebAppEmitter;

impl ResourceEmitter for WebAppEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        insert_if_present(&mut decl, "identity", &ctx.resource.identity);
        let server_farm = ctx
            .plan_reference
            .clone()
            .unwrap_or_else(|| "[parameters('defaultAppServicePlan')]".to_string());
        decl.insert(
            "properties".into(),
            json!({"serverFarmId": server_farm, "httpsOnly": true}),
        );
        Value::Object(decl)
    }
}

pub struct SqlServerEmitter;

impl ResourceEmitter for SqlServerEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        let login = prop_str(ctx.resource, "/administratorLogin").unwrap_or("sqladmin");
        let version = prop_str(ctx.resource, "/version").unwrap_or("12.0");
        decl.insert(
            "properties".into(),
            json!({
                "administratorLogin": login,
                "administratorLoginPassword": "[parameters('sqlAdminPassword')]",
                "version": version
            }),
        );
        Value::Object(decl)
    }
}

pub struct CosmosDbEmitter;

impl ResourceEmitter for CosmosDbEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        let kind = ctx
            .resource
            .kind
            .clone()
            .unwrap_or_else(|| "GlobalDocumentDB".into());
        decl.insert("kind".into(), json!(kind));

        let consistency = ctx
            .resource
            .properties
            .pointer("/consistencyPolicy")
            .cloned()
            .unwrap_or_else(|| json!({"defaultConsistencyLevel": "Session"}));
        decl.insert(
            "properties".into(),
            json!({
                "databaseAccountOfferType": "Standard",
                "locations": [{
                    "locationName": ctx.location_expr(),
                    "failoverPriority": 0
                }],
                "consistencyPolicy": consistency
            }),
        );
        Value::Object(decl)
    }
}

pub struct ServiceBusEmitter;

impl ResourceEmitter for ServiceBusEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        let sku = ctx
            .resource
            .sku
            .clone()
            .filter(|s| s.pointer("/name").is_some())
            .unwrap_or_else(|| json!({"name": "Standard", "tier": "Standard"}));
        decl.insert("sku".into(), sku);
        decl.insert("properties".into(), json!({}));
        Value::Object(decl)
    }
}

pub struct KeyVaultEmitter;

impl ResourceEmitter for KeyVaultEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        let sku_name = ctx
            .resource
            .properties
            .pointer("/sku/name")
            .and_then(Value::as_str)
            .unwrap_or("standard");
        let tenant_id = prop_str(ctx.resource, "/tenantId")
            .map(String::from)
            .unwrap_or_else(|| "[subscription().tenantId]".to_string());

        let mut properties = Map::new();
        properties.insert("sku".into(), json!({"family": "A", "name": sku_name}));
        properties.insert("tenantId".into(), json!(tenant_id));
        // Access policies carry principal ids from the source tenant and are
        // never cloned.
        properties.insert("accessPolicies".into(), json!([]));
        for flag in ["enabledForDeployment", "enabledForTemplateDeployment"] {
            if let Some(value) = ctx
                .resource
                .properties
                .pointer(&format!("/{}", flag))
                .and_then(Value::as_bool)
            {
                properties.insert(flag.to_string(), json!(value));
            }
        }
        decl.insert("properties".into(), Value::Object(properties));
        Value::Object(decl)
    }
}

/// Fallback for everything without a dedicated emitter: scaffolding plus
/// the sanitized source property document.
pub struct GenericEmitter;

impl ResourceEmitter for GenericEmitter {
    fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        let mut decl = base_declaration(ctx);
        if let Some(kind) = &ctx.resource.kind {
            decl.insert("kind".into(), json!(kind));
        }
        insert_if_present(&mut decl, "sku", &ctx.resource.sku);
        insert_if_present(&mut decl, "identity", &ctx.resource.identity);
        insert_if_present(&mut decl, "plan", &ctx.resource.plan);

        let properties = if ctx.resource.properties.is_object() {
            sanitize(&ctx.resource.properties)
        } else {
            json!({})
        };
        decl.insert("properties".into(), properties);
        Value::Object(decl)
    }
}

/// Registry dispatching resource types to emitters.
pub struct EmitterRegistry {
    emitters: HashMap<String, Box<dyn ResourceEmitter>>,
    generic: Box<dyn ResourceEmitter>,
}

impl EmitterRegistry {
    pub fn new() -> Self {
        let mut emitters: HashMap<String, Box<dyn ResourceEmitter>> = HashMap::new();
        emitters.insert(
            "microsoft.storage/storageaccounts".into(),
            Box::new(StorageAccountEmitter),
        );
        emitters.insert(
            "microsoft.network/virtualnetworks".into(),
            Box::new(VirtualNetworkEmitter),
        );
        emitters.insert(
            "microsoft.network/networksecuritygroups".into(),
            Box::new(NetworkSecurityGroupEmitter),
        );
        emitters.insert(
            "microsoft.network/publicipaddresses".into(),
            Box::new(PublicIpEmitter),
        );
        emitters.insert(
            "microsoft.network/networkinterfaces".into(),
            Box::new(NetworkInterfaceEmitter),
        );
        emitters.insert(
            "microsoft.compute/virtualmachines".into(),
            Box::new(VirtualMachineEmitter),
        );
        emitters.insert(
            "microsoft.web/serverfarms".into(),
            Box::new(AppServicePlanEmitter),
        );
        emitters.insert("microsoft.web/sites".into(), Box::new(WebAppEmitter));
        emitters.insert("microsoft.sql/servers".into(), Box::new(SqlServerEmitter));
        emitters.insert(
            "microsoft.documentdb/databaseaccounts".into(),
            Box::new(CosmosDbEmitter),
        );
        emitters.insert(
            "microsoft.servicebus/namespaces".into(),
            Box::new(ServiceBusEmitter),
        );
        emitters.insert(
            "microsoft.keyvault/vaults".into(),
            Box::new(KeyVaultEmitter),
        );
        Self {
            emitters,
            generic: Box::new(GenericEmitter),
        }
    }

    pub fn emit(&self, ctx: &EmitContext<'_>) -> Value {
        self.emitters
            .get(&ctx.resource.resource_type.to_ascii_lowercase())
            .unwrap_or(&self.generic)
            .emit(ctx)
    }
}

impl Default for EmitterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
