//! Per-resource-type dependency extractors.
//!
//! Each extractor inspects one resource's property document and names the
//! ARM ids it depends on. A missing or oddly-shaped property yields no edge
//! rather than an error, because the graph query returns whatever shape the
//! provider stored.

use std::sync::LazyLock;

use azclone_core::azure::{AzureResourceId, normalize_id, same_resource};
use azclone_core::status::EdgeType;
use azclone_db::DiscoveredResource;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// A dependency found by an extractor, expressed as the target's ARM id.
/// The analyzer resolves it against the session's resource set.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    pub target_azure_id: String,
    pub edge_type: EdgeType,
    pub required: bool,
}

impl EdgeSpec {
    fn new(target_azure_id: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            target_azure_id: target_azure_id.into(),
            edge_type,
            required: true,
        }
    }

    fn weak(target_azure_id: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            required: false,
            ..Self::new(target_azure_id, edge_type)
        }
    }
}

/// Lookup over the full resource set of one session, keyed by normalized
/// ARM id.
pub struct ResourceIndex<'a> {
    by_azure_id: HashMap<String, &'a DiscoveredResource>,
}

impl<'a> ResourceIndex<'a> {
    pub fn new(resources: &'a [DiscoveredResource]) -> Self {
        let by_azure_id = resources
            .iter()
            .map(|r| (normalize_id(&r.azure_id), r))
            .collect();
        Self { by_azure_id }
    }

    pub fn by_azure_id(&self, id: &str) -> Option<&'a DiscoveredResource> {
        self.by_azure_id.get(&normalize_id(id)).copied()
    }

    /// Resolve a reference that may point at a child resource (subnet,
    /// backend pool) to the top-level resource present in the session.
    pub fn resolve(&self, id: &str) -> Option<&'a DiscoveredResource> {
        if let Some(resource) = self.by_azure_id(id) {
            return Some(resource);
        }
        let parsed = AzureResourceId::parse(id)?;
        if parsed.is_child() {
            self.by_azure_id(&parsed.top_level_id())
        } else {
            None
        }
    }

    /// Match a URI such as `https://myvault.vault.azure.net/` to the session
    /// resource of the given type named after the host's first label.
    pub fn by_uri_host(&self, uri: &str, resource_type: &str) -> Option<&'a DiscoveredResource> {
        let host = uri.split("://").nth(1)?.split('/').next()?;
        let name = host.split('.').next()?;
        self.by_azure_id
            .values()
            .find(|r| {
                r.resource_type.eq_ignore_ascii_case(resource_type)
                    && r.name.eq_ignore_ascii_case(name)
            })
            .copied()
    }
}

pub trait DependencyExtractor: Send + Sync {
    fn extract(&self, resource: &DiscoveredResource, index: &ResourceIndex<'_>) -> Vec<EdgeSpec>;
}

fn str_at<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn array_at<'v>(value: &'v Value, pointer: &str) -> impl Iterator<Item = &'v Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
}

/// Push the top-level resource behind a (possibly child) reference.
fn push_parent(edges: &mut Vec<EdgeSpec>, id: &str, edge_type: EdgeType) {
    match AzureResourceId::parse(id) {
        Some(parsed) if parsed.is_child() => edges.push(EdgeSpec::new(parsed.top_level_id(), edge_type)),
        _ => edges.push(EdgeSpec::new(id, edge_type)),
    }
}

/// Virtual machine: NICs, managed disks, VHD storage accounts, availability
/// set.
pub struct VirtualMachineExtractor;

impl DependencyExtractor for VirtualMachineExtractor {
    fn extract(&self, resource: &DiscoveredResource, index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let props = &resource.properties;
        let mut edges = Vec::new();

        for nic in array_at(props, "/networkProfile/networkInterfaces") {
            if let Some(id) = str_at(nic, "/id") {
                edges.push(EdgeSpec::new(id, EdgeType::Network));
            }
        }

        let mut disks: Vec<&Value> = props
            .pointer("/storageProfile/osDisk")
            .into_iter()
            .collect();
        disks.extend(array_at(props, "/storageProfile/dataDisks"));
        for disk in disks {
            if let Some(id) = str_at(disk, "/managedDisk/id") {
                edges.push(EdgeSpec::new(id, EdgeType::Storage));
            }
            if let Some(uri) = str_at(disk, "/vhd/uri") {
                if let Some(account) = index.by_uri_host(uri, "Microsoft.Storage/storageAccounts") {
                    edges.push(EdgeSpec::new(account.azure_id.clone(), EdgeType::Storage));
                }
            }
        }

        if let Some(id) = str_at(props, "/availabilitySet/id") {
            edges.push(EdgeSpec::new(id, EdgeType::Configuration));
        }

        edges
    }
}

/// Network interface: owning VNet of each subnet, public IPs, load-balancer
/// backend pools, NSG.
pub struct NetworkInterfaceExtractor;

impl DependencyExtractor for NetworkInterfaceExtractor {
    fn extract(&self, resource: &DiscoveredResource, _index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let props = &resource.properties;
        let mut edges = Vec::new();

        for ip_config in array_at(props, "/ipConfigurations") {
            if let Some(id) = str_at(ip_config, "/properties/subnet/id") {
                push_parent(&mut edges, id, EdgeType::Network);
            }
            if let Some(id) = str_at(ip_config, "/properties/publicIPAddress/id") {
                edges.push(EdgeSpec::new(id, EdgeType::Network));
            }
            for pool in array_at(ip_config, "/properties/loadBalancerBackendAddressPools") {
                if let Some(id) = str_at(pool, "/id") {
                    push_parent(&mut edges, id, EdgeType::Network);
                }
            }
        }

        if let Some(id) = str_at(props, "/networkSecurityGroup/id") {
            edges.push(EdgeSpec::new(id, EdgeType::Network));
        }

        edges
    }
}

/// Storage account: CMK key vault, VNet rules.
pub struct StorageAccountExtractor;

impl DependencyExtractor for StorageAccountExtractor {
    fn extract(&self, resource: &DiscoveredResource, index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let props = &resource.properties;
        let mut edges = Vec::new();

        if let Some(uri) = str_at(props, "/encryption/keyvaultproperties/keyvaulturi") {
            if let Some(vault) = index.by_uri_host(uri, "Microsoft.KeyVault/vaults") {
                edges.push(EdgeSpec::new(vault.azure_id.clone(), EdgeType::Identity));
            }
        }

        for rule in array_at(props, "/networkAcls/virtualNetworkRules") {
            if let Some(id) = str_at(rule, "/id") {
                push_parent(&mut edges, id, EdgeType::Network);
            }
        }

        edges
    }
}

/// Web app: its server farm (plan) and VNet-integration subnet.
pub struct WebAppExtractor;

impl DependencyExtractor for WebAppExtractor {
    fn extract(&self, resource: &DiscoveredResource, _index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let props = &resource.properties;
        let mut edges = Vec::new();

        if let Some(id) = str_at(props, "/serverFarmId") {
            edges.push(EdgeSpec::new(id, EdgeType::ParentChild));
        }
        if let Some(id) = str_at(props, "/virtualNetworkSubnetId") {
            push_parent(&mut edges, id, EdgeType::Network);
        }

        edges
    }
}

/// SQL server: TDE key-vault key, VNet rules.
pub struct SqlServerExtractor;

impl DependencyExtractor for SqlServerExtractor {
    fn extract(&self, resource: &DiscoveredResource, index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let props = &resource.properties;
        let mut edges = Vec::new();

        if let Some(uri) = str_at(props, "/keyId") {
            if let Some(vault) = index.by_uri_host(uri, "Microsoft.KeyVault/vaults") {
                edges.push(EdgeSpec::new(vault.azure_id.clone(), EdgeType::Identity));
            }
        }

        for rule in array_at(props, "/virtualNetworkRules") {
            let subnet = str_at(rule, "/properties/virtualNetworkSubnetId")
                .or_else(|| str_at(rule, "/id"));
            if let Some(id) = subnet {
                push_parent(&mut edges, id, EdgeType::Network);
            }
        }

        edges
    }
}

/// Key vault: VNet rules.
pub struct KeyVaultExtractor;

impl DependencyExtractor for KeyVaultExtractor {
    fn extract(&self, resource: &DiscoveredResource, _index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let mut edges = Vec::new();
        for rule in array_at(&resource.properties, "/networkAcls/virtualNetworkRules") {
            if let Some(id) = str_at(rule, "/id") {
                push_parent(&mut edges, id, EdgeType::Network);
            }
        }
        edges
    }
}

/// Virtual network: peerings to remote VNets.
pub struct VirtualNetworkExtractor;

impl DependencyExtractor for VirtualNetworkExtractor {
    fn extract(&self, resource: &DiscoveredResource, _index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let mut edges = Vec::new();
        for peering in array_at(&resource.properties, "/virtualNetworkPeerings") {
            if let Some(id) = str_at(peering, "/properties/remoteVirtualNetwork/id") {
                edges.push(EdgeSpec::new(id, EdgeType::Network));
            }
        }
        edges
    }
}

static RESOURCE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"/subscriptions/[^/]+/resourceGroups/[^/]+/providers/[^/]+/[^/]+/[^"'\s,}]+"#)
        .expect("resource id regex compiles")
});

/// Fallback for types without a dedicated extractor: scan the raw property
/// document for ARM ids and record weak configuration edges to anything the
/// session knows about.
pub struct GenericExtractor;

impl DependencyExtractor for GenericExtractor {
    fn extract(&self, resource: &DiscoveredResource, index: &ResourceIndex<'_>) -> Vec<EdgeSpec> {
        let text = resource.properties.to_string();
        let mut edges = Vec::new();
        for found in RESOURCE_ID_REGEX.find_iter(&text) {
            let id = found.as_str();
            if same_resource(id, &resource.azure_id) {
                continue;
            }
            if let Some(target) = index.resolve(id) {
                if !same_resource(&target.azure_id, &resource.azure_id) {
                    edges.push(EdgeSpec::weak(target.azure_id.clone(), EdgeType::Configuration));
                }
            }
        }
        edges
    }
}
