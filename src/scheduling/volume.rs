//! Volume usage ledger

use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::core::v1::Pod;

use crate::kube_client::ClusterClient;
use crate::utils::pod::PodKey;
use crate::{Error, Result};

/// Resolve the exclusive volume identities a pod claims
///
/// Persistent-volume-claim references are verified against the API server;
/// a claim that cannot be read fails the whole resolution so the caller
/// writes no partial ledger state and retries the full pod update.
/// Generic ephemeral volumes resolve to their generated claim name without
/// a lookup (the claim is created from the pod's own template).
pub async fn get_volumes(client: &dyn ClusterClient, pod: &Pod) -> Result<Vec<String>> {
    let pod_key = PodKey::from_pod(pod);
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let mut volumes = Vec::new();
    for volume in pod.spec.iter().flat_map(|s| s.volumes.iter().flatten()) {
        if let Some(source) = &volume.persistent_volume_claim {
            match client
                .get_persistent_volume_claim(&namespace, &source.claim_name)
                .await
            {
                Ok(Some(_)) => volumes.push(format!("{namespace}/{}", source.claim_name)),
                Ok(None) => {
                    return Err(Error::VolumeResolution {
                        pod: pod_key.to_string(),
                        claim: source.claim_name.clone(),
                        reason: "persistent volume claim not found".to_string(),
                    })
                }
                Err(err) => {
                    return Err(Error::VolumeResolution {
                        pod: pod_key.to_string(),
                        claim: source.claim_name.clone(),
                        reason: err.to_string(),
                    })
                }
            }
        } else if volume.ephemeral.is_some() {
            // generated claim name is <pod>-<volume>
            volumes.push(format!("{namespace}/{}-{}", pod_key.name, volume.name));
        }
    }
    Ok(volumes)
}

/// Per-pod ledger of exclusive volume claims on one node
#[derive(Clone, Debug, Default)]
pub struct VolumeUsage {
    used: HashMap<PodKey, BTreeSet<String>>,
}

impl VolumeUsage {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pod's volume claims
    pub fn add(&mut self, pod: PodKey, volumes: Vec<String>) {
        self.used.insert(pod, volumes.into_iter().collect());
    }

    /// Remove every claim made by the pod. Idempotent.
    pub fn delete_pod(&mut self, pod: &PodKey) {
        self.used.remove(pod);
    }

    /// Take over every claim from another ledger, keeping ours on collision
    pub(crate) fn absorb(&mut self, other: VolumeUsage) {
        for (pod, volumes) in other.used {
            self.used.entry(pod).or_insert(volumes);
        }
    }

    /// True if the ledger has an entry for the pod
    pub fn contains_pod(&self, pod: &PodKey) -> bool {
        self.used.contains_key(pod)
    }

    /// The union of volume identities in use on this node
    pub fn volumes(&self) -> BTreeSet<String> {
        self.used.values().flatten().cloned().collect()
    }

    /// True if no pods hold any claims
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EphemeralVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSpec,
        Volume,
    };
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;

    use crate::kube_client::MockClusterClient;

    fn pod_with_volumes(volumes: Vec<Volume>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("web-0".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pvc_volume(name: &str, claim: &str) -> Volume {
        Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_pvc_and_ephemeral_volumes() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_persistent_volume_claim()
            .with(eq("default"), eq("data-web-0"))
            .returning(|_, _| Ok(Some(PersistentVolumeClaim::default())));

        let pod = pod_with_volumes(vec![
            pvc_volume("data", "data-web-0"),
            Volume {
                name: "scratch".into(),
                ephemeral: Some(EphemeralVolumeSource::default()),
                ..Default::default()
            },
        ]);

        let volumes = get_volumes(&client, &pod).await.unwrap();
        assert_eq!(volumes, vec!["default/data-web-0", "default/web-0-scratch"]);
    }

    #[tokio::test]
    async fn missing_claim_fails_resolution() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_persistent_volume_claim()
            .returning(|_, _| Ok(None));

        let pod = pod_with_volumes(vec![pvc_volume("data", "gone")]);
        let err = get_volumes(&client, &pod).await.unwrap_err();
        assert!(matches!(
            err,
            Error::VolumeResolution { ref claim, .. } if claim == "gone"
        ));
    }

    #[test]
    fn ledger_tracks_the_union_of_claims() {
        let mut usage = VolumeUsage::new();
        usage.add(
            PodKey::new("default", "web-0"),
            vec!["default/data-web-0".into()],
        );
        usage.add(
            PodKey::new("default", "web-1"),
            vec!["default/data-web-1".into()],
        );

        assert_eq!(usage.volumes().len(), 2);

        usage.delete_pod(&PodKey::new("default", "web-0"));
        assert_eq!(
            usage.volumes().into_iter().collect::<Vec<_>>(),
            vec!["default/data-web-1"]
        );
    }
}
