use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AIOpsSpec defines the desired state of AIOps
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default)]
#[kube(
    group = "aiops.geektime.com",
    version = "v1alpha1",
    kind = "AIOps",
    namespaced
)]
#[kube(status = "AIOpsStatus")]
#[serde(rename_all = "camelCase")]
pub struct AIOpsSpec {
    /// Free-form description of what this resource automates.
    #[serde(default)]
    pub description: Option<String>,

    /// Pause handling of this resource. Changes are still cached, but the
    /// controller only reports them.
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AIOpsStatus {
    /// Generation last seen by the controller.
    #[serde(default)]
    pub observed_generation: Option<i64>,
}
