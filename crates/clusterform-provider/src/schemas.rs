//! Resource types of the managed Kubernetes platform.

use clusterform_core::{AttributeSchema as A, ReplacePolicy, ResourceSchema, SchemaSet};

/// Regions the platform serves.
pub const REGIONS: &[&str] = &[
    "ams3", "blr1", "fra1", "lon1", "nyc1", "nyc3", "sfo3", "sgp1", "syd1", "tor1",
];

/// `cluster`, `node_pool`, `project_resources` and `namespace`.
pub fn cloud_schemas() -> SchemaSet {
    SchemaSet::new()
        .with(
            ResourceSchema::new("cluster")
                .attribute("name", A::required())
                .attribute("region", A::required().force_new())
                .attribute("version", A::required())
                .attribute("node_pool", A::optional())
                .attribute("tags", A::optional())
                .attribute("id", A::computed())
                .attribute("urn", A::computed())
                .attribute("endpoint", A::computed())
                .attribute("ipv4_address", A::computed())
                .attribute("status", A::computed())
                .attribute("created_at", A::computed())
                .attribute("kube_config", A::computed().sensitive())
                .replace_policy(ReplacePolicy::CreateBeforeDestroy),
        )
        .with(
            ResourceSchema::new("node_pool")
                .attribute("cluster_id", A::required().force_new())
                .attribute("name", A::required().force_new())
                .attribute("size", A::required().force_new())
                .attribute("node_count", A::required())
                .attribute("labels", A::optional())
                .attribute("id", A::computed())
                .attribute("nodes", A::computed()),
        )
        .with(
            ResourceSchema::new("project_resources")
                .attribute("project", A::required().force_new())
                .attribute("resources", A::required())
                .attribute("id", A::computed()),
        )
        .with(
            ResourceSchema::new("namespace")
                .attribute("name", A::required().force_new())
                .attribute("host", A::required().force_new())
                .attribute("token", A::required().sensitive())
                .attribute("cluster_ca_certificate", A::required().sensitive())
                .attribute("labels", A::optional())
                .attribute("id", A::computed())
                .attribute("uid", A::computed()),
        )
}
