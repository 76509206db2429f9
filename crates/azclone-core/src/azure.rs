//! Azure resource-id parsing and comparison.
//!
//! ARM resource ids look like
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}`
//! optionally followed by child pairs such as `/subnets/{name}`. Ids are
//! case-insensitive on the Azure side, so all comparisons here normalize to
//! lowercase.

use serde::{Deserialize, Serialize};

/// A parsed ARM resource id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureResourceId {
    /// The id as it appeared in the source, untouched.
    pub raw: String,
    pub subscription_id: String,
    pub resource_group: String,
    /// Provider namespace, e.g. `Microsoft.Network`.
    pub provider: String,
    /// Type/name pairs, outermost first. The first pair is the top-level
    /// resource, the rest are children (`subnets/s0`, ...).
    pub segments: Vec<(String, String)>,
}

impl AzureResourceId {
    /// Parse an ARM resource id. Returns `None` for anything that does not
    /// follow the `/subscriptions/.../providers/...` shape; callers treat
    /// those as opaque references.
    pub fn parse(id: &str) -> Option<Self> {
        let parts: Vec<&str> = id.trim_matches('/').split('/').collect();
        if parts.len() < 8 {
            return None;
        }
        if !parts[0].eq_ignore_ascii_case("subscriptions")
            || !parts[2].eq_ignore_ascii_case("resourceGroups")
            || !parts[4].eq_ignore_ascii_case("providers")
        {
            return None;
        }
        let subscription_id = parts[1].to_string();
        let resource_group = parts[3].to_string();
        let provider = parts[5].to_string();

        let mut segments = Vec::new();
        let mut rest = &parts[6..];
        while rest.len() >= 2 {
            segments.push((rest[0].to_string(), rest[1].to_string()));
            rest = &rest[2..];
        }
        if segments.is_empty() || !rest.is_empty() {
            return None;
        }

        Some(Self {
            raw: id.to_string(),
            subscription_id,
            resource_group,
            provider,
            segments,
        })
    }

    /// The full resource type, e.g. `Microsoft.Network/virtualNetworks`.
    /// Child segments are appended for nested ids
    /// (`Microsoft.Network/virtualNetworks/subnets`).
    pub fn resource_type(&self) -> String {
        let mut t = self.provider.clone();
        for (kind, _) in &self.segments {
            t.push('/');
            t.push_str(kind);
        }
        t
    }

    /// Name of the innermost resource.
    pub fn name(&self) -> &str {
        &self.segments.last().expect("segments is never empty").1
    }

    /// Id of the top-level resource, with child segments stripped.
    /// For `/...virtualNetworks/vnet-a/subnets/s0` this is the vnet id.
    pub fn top_level_id(&self) -> String {
        let (kind, name) = &self.segments[0];
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription_id, self.resource_group, self.provider, kind, name
        )
    }

    /// True if this id has child segments below the top-level resource.
    pub fn is_child(&self) -> bool {
        self.segments.len() > 1
    }
}

/// Normalize an ARM id for case-insensitive keying.
pub fn normalize_id(id: &str) -> String {
    id.trim_end_matches('/').to_ascii_lowercase()
}

/// Case-insensitive id equality, the way ARM treats ids.
pub fn same_resource(a: &str, b: &str) -> bool {
    normalize_id(a) == normalize_id(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VNET: &str = "/subscriptions/sub-1/resourceGroups/rg-a/providers/Microsoft.Network/virtualNetworks/vnet-a";

    #[test]
    fn parses_top_level_id() {
        let id = AzureResourceId::parse(VNET).unwrap();
        assert_eq!(id.subscription_id, "sub-1");
        assert_eq!(id.resource_group, "rg-a");
        assert_eq!(id.provider, "Microsoft.Network");
        assert_eq!(id.resource_type(), "Microsoft.Network/virtualNetworks");
        assert_eq!(id.name(), "vnet-a");
        assert!(!id.is_child());
    }

    #[test]
    fn parses_child_id_and_strips_to_parent() {
        let subnet = format!("{}/subnets/s0", VNET);
        let id = AzureResourceId::parse(&subnet).unwrap();
        assert!(id.is_child());
        assert_eq!(id.name(), "s0");
        assert_eq!(
            id.resource_type(),
            "Microsoft.Network/virtualNetworks/subnets"
        );
        assert!(same_resource(&id.top_level_id(), VNET));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(AzureResourceId::parse("").is_none());
        assert!(AzureResourceId::parse("https://example.com/foo").is_none());
        assert!(AzureResourceId::parse("/subscriptions/sub-1").is_none());
        // Dangling type segment with no name.
        assert!(
            AzureResourceId::parse(
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks"
            )
            .is_none()
        );
    }

    #[test]
    fn comparison_ignores_case() {
        assert!(same_resource(VNET, &VNET.to_uppercase()));
        assert!(!same_resource(VNET, "/subscriptions/sub-2/x"));
    }
}
