//! Dependency analysis over a session's resource set.
//!
//! A registry maps resource type strings to extractors; types without a
//! dedicated extractor fall back to a property-document scan. Extracted
//! references are resolved against the session's resources, self-edges are
//! dropped, and `(source, target)` pairs are de-duplicated
//! case-insensitively.

use std::collections::{HashMap, HashSet};

use azclone_core::EntityId;
use azclone_core::azure::{normalize_id, same_resource};
use azclone_core::status::EdgeType;
use azclone_db::{DiscoveredResource, ResourceEdge};
use tracing::debug;

use crate::extractors::{
    DependencyExtractor, GenericExtractor, KeyVaultExtractor, NetworkInterfaceExtractor,
    ResourceIndex, SqlServerExtractor, StorageAccountExtractor, VirtualMachineExtractor,
    VirtualNetworkExtractor, WebAppExtractor,
};

pub struct DependencyAnalyzer {
    extractors: HashMap<String, Box<dyn DependencyExtractor>>,
    fallback: Box<dyn DependencyExtractor>,
}

impl DependencyAnalyzer {
    pub fn new() -> Self {
        let mut extractors: HashMap<String, Box<dyn DependencyExtractor>> = HashMap::new();
        extractors.insert(
            "microsoft.compute/virtualmachines".into(),
            Box::new(VirtualMachineExtractor),
        );
        extractors.insert(
            "microsoft.network/networkinterfaces".into(),
            Box::new(NetworkInterfaceExtractor),
        );
        extractors.insert(
            "microsoft.storage/storageaccounts".into(),
            Box::new(StorageAccountExtractor),
        );
        extractors.insert("microsoft.web/sites".into(), Box::new(WebAppExtractor));
        extractors.insert("microsoft.sql/servers".into(), Box::new(SqlServerExtractor));
        extractors.insert(
            "microsoft.keyvault/vaults".into(),
            Box::new(KeyVaultExtractor),
        );
        extractors.insert(
            "microsoft.network/virtualnetworks".into(),
            Box::new(VirtualNetworkExtractor),
        );
        Self {
            extractors,
            fallback: Box::new(GenericExtractor),
        }
    }

    /// Produce the edge set for one session's resources. Pure computation;
    /// re-running on the same input yields the same pairs.
    pub fn analyze(
        &self,
        session_id: EntityId,
        resources: &[DiscoveredResource],
    ) -> Vec<ResourceEdge> {
        let index = ResourceIndex::new(resources);
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut edges = Vec::new();

        for resource in resources {
            let extractor = self
                .extractors
                .get(&resource.resource_type.to_ascii_lowercase())
                .unwrap_or(&self.fallback);

            for spec in extractor.extract(resource, &index) {
                let Some(target) = index.resolve(&spec.target_azure_id) else {
                    debug!(
                        source = %resource.azure_id,
                        target = %spec.target_azure_id,
                        "Dependency target not in session, skipping"
                    );
                    continue;
                };
                if same_resource(&target.azure_id, &resource.azure_id) {
                    continue;
                }
                if !seen.insert((normalize_id(&resource.id), normalize_id(&target.id))) {
                    continue;
                }

                // A dependency that crosses resource groups cannot be
                // satisfied inside one template; the edge is kept for
                // leveling but re-classified.
                let edge_type = if resource
                    .resource_group
                    .eq_ignore_ascii_case(&target.resource_group)
                {
                    spec.edge_type
                } else {
                    EdgeType::CrossResourceGroup
                };

                edges.push(ResourceEdge::new(
                    session_id,
                    resource.id.clone(),
                    target.id.clone(),
                    edge_type,
                    spec.required,
                ));
            }
        }

        edges
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
