//! The shipped reconciler: reports every change it is handed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use thiserror::Error;

use crate::cache::Lookup;
use crate::key::ObjectKey;

#[derive(Debug, Default)]
pub struct Data {
    /// Object names whose reconcile always fails, for exercising the retry
    /// path against a live cluster.
    pub fail_names: HashSet<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Simulated failure for {0}")]
    Simulated(ObjectKey),
}

pub async fn reconcile<K>(key: ObjectKey, lookup: Lookup<K>, ctx: Arc<Data>) -> Result<(), Error>
where
    K: Resource<DynamicType = ()>,
{
    if lookup.is_present() && ctx.fail_names.contains(key.name()) {
        return Err(Error::Simulated(key));
    }
    println!("{}", describe(&key, &lookup, Utc::now()));
    Ok(())
}

pub fn describe<K>(key: &ObjectKey, lookup: &Lookup<K>, now: DateTime<Utc>) -> String
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    match lookup {
        Lookup::Absent => format!("{} {} does not exist anymore", kind, key),
        Lookup::Present(obj) => match obj.meta().creation_timestamp.as_ref() {
            Some(created) => format!(
                "Sync/Add/Update for {} {} (age {}s)",
                kind,
                key,
                (now - created.0).num_seconds().max(0)
            ),
            None => format!("Sync/Add/Update for {} {}", kind, key),
        },
    }
}

/// One line of `get` output.
pub fn describe_listed<K: Resource>(obj: &K) -> String {
    format!(
        "Name: {}, Namespace: {}, UID: {}",
        obj.name(),
        obj.namespace().unwrap_or_default(),
        obj.uid().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;
    use crate::types::{AIOps, AIOpsSpec};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn describes_present_and_absent() {
        let key = ObjectKey::namespaced("default", "web");
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(now() - Duration::seconds(90))),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert_eq!(
            describe(&key, &Lookup::Present(Arc::new(pod)), now()),
            "Sync/Add/Update for Pod default/web (age 90s)"
        );
        assert_eq!(
            describe::<Pod>(&key, &Lookup::Absent, now()),
            "Pod default/web does not exist anymore"
        );
        assert_eq!(
            describe(&key, &Lookup::Present(Arc::new(Pod::default())), now()),
            "Sync/Add/Update for Pod default/web"
        );
    }

    #[test]
    fn describes_listed_custom_resource() {
        let mut obj = AIOps::new("restarter", AIOpsSpec::default());
        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.uid = Some("1234".to_string());
        assert_eq!(
            describe_listed(&obj),
            "Name: restarter, Namespace: default, UID: 1234"
        );
    }

    #[tokio::test]
    async fn fails_only_for_configured_names() {
        let ctx = Arc::new(Data {
            fail_names: ["flaky".to_string()].into_iter().collect(),
        });
        let flaky = ObjectKey::namespaced("default", "flaky");
        let present = Lookup::Present(Arc::new(Pod::default()));

        let result = reconcile(flaky.clone(), present.clone(), Arc::clone(&ctx)).await;
        assert!(matches!(result, Err(Error::Simulated(key)) if key == flaky));

        // deletions always go through
        reconcile::<Pod>(flaky, Lookup::Absent, Arc::clone(&ctx))
            .await
            .unwrap();
        reconcile(ObjectKey::namespaced("default", "fine"), present, ctx)
            .await
            .unwrap();
    }
}
