//! Metadata merge policy applied between an observed and a desired object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// Annotations under this prefix are written by `kubectl` (e.g. `rollout restart`).
pub const KUBECTL_ANNOTATION_PREFIX: &str = "kubectl.kubernetes.io/";

/// Carry the version token over from `observed` and merge its labels and
/// annotations into `desired`. On key collision the desired value wins; keys
/// only present on the observed object are kept.
pub fn merge_metadata(desired: &mut ObjectMeta, observed: &ObjectMeta) {
    desired.resource_version = observed.resource_version.clone();
    desired.labels = merge_maps(desired.labels.take(), observed.labels.as_ref());
    desired.annotations = merge_maps(desired.annotations.take(), observed.annotations.as_ref());
}

fn merge_maps(
    desired: Option<BTreeMap<String, String>>,
    observed: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (desired, observed) {
        (None, None) => None,
        (desired, observed) => {
            let mut out = observed.cloned().unwrap_or_default();
            out.extend(desired.unwrap_or_default());
            Some(out)
        }
    }
}

/// Observed references first, then every desired reference not already present.
pub fn merge_owner_references(observed: &[OwnerReference], desired: &[OwnerReference]) -> Vec<OwnerReference> {
    let mut out = observed.to_vec();
    for r in desired {
        if !out.contains(r) {
            out.push(r.clone());
        }
    }
    out
}

/// Keep annotations set by kubectl on a live pod template.
///
/// Every `kubectl.kubernetes.io/` annotation found on `observed_template`
/// overrides the entry of `desired_template`, so a manually triggered
/// restart marker survives the operator's next update.
pub fn merge_kubectl_annotations(desired_template: &mut ObjectMeta, observed_template: &ObjectMeta) {
    let Some(observed) = observed_template.annotations.as_ref() else { return };
    let mut kubectl = observed.iter().filter(|(k, _)| k.starts_with(KUBECTL_ANNOTATION_PREFIX)).peekable();
    if kubectl.peek().is_none() {
        return;
    }
    let annotations = desired_template.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in kubectl {
        annotations.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn meta(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta { labels: Some(map(labels)), annotations: Some(map(labels)), ..Default::default() }
    }

    fn owner(name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "monitoring.coreos.com/v1".into(),
            kind: "Prometheus".into(),
            name: name.into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn merge_metadata_keeps_observed_only_keys() {
        let mut desired = meta(&[("app", "ksm")]);
        let mut observed = meta(&[("app", "ksm"), ("label", "value")]);
        observed.resource_version = Some("42".into());
        merge_metadata(&mut desired, &observed);
        assert_eq!(desired.labels, Some(map(&[("app", "ksm"), ("label", "value")])));
        assert_eq!(desired.annotations, Some(map(&[("app", "ksm"), ("label", "value")])));
        assert_eq!(desired.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn merge_metadata_desired_wins_on_collision() {
        let mut desired = meta(&[("app", "ksm")]);
        let observed = meta(&[("app", "overridden")]);
        merge_metadata(&mut desired, &observed);
        assert_eq!(desired.labels, Some(map(&[("app", "ksm")])));
    }

    #[test]
    fn merge_metadata_leaves_absent_maps_absent() {
        let mut desired = ObjectMeta::default();
        merge_metadata(&mut desired, &ObjectMeta::default());
        assert_eq!(desired.labels, None);
        assert_eq!(desired.annotations, None);
    }

    #[test]
    fn owner_references_are_appended_not_replaced() {
        let a = owner("a", "1");
        let b = owner("b", "2");
        let merged = merge_owner_references(&[a.clone()], &[b.clone(), a.clone()]);
        assert_eq!(merged, vec![a.clone(), b.clone()]);
        // same name, different uid is a different owner
        let a2 = owner("a", "3");
        assert_eq!(merge_owner_references(&[a.clone()], &[a2.clone()]), vec![a, a2]);
        assert!(merge_owner_references(&[], &[]).is_empty());
    }

    #[test]
    fn kubectl_annotations_follow_live_template() {
        let cases: Vec<(Option<BTreeMap<String, String>>, Option<BTreeMap<String, String>>, Option<BTreeMap<String, String>>)> = vec![
            // no annotations anywhere
            (None, None, None),
            // owned annotation added
            (None, Some(map(&[("test-key", "test-value")])), Some(map(&[("test-key", "test-value")]))),
            // owned annotation changed
            (
                Some(map(&[("test-key", "test-value")])),
                Some(map(&[("test-key", "modified-test-value")])),
                Some(map(&[("test-key", "modified-test-value")])),
            ),
            // owned annotation removed
            (Some(map(&[("test-key", "test-value")])), Some(map(&[])), Some(map(&[]))),
            // kubectl annotation added by the operator
            (
                Some(map(&[("test-key", "test-value")])),
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")])),
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")])),
            ),
            // kubectl annotation modified: live value wins
            (
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "yesterday")])),
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")])),
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "yesterday")])),
            ),
            // kubectl annotation dropped from desired: live value survives
            (
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")])),
                Some(map(&[])),
                Some(map(&[("kubectl.kubernetes.io/restartedAt", "now")])),
            ),
        ];
        for (i, (existing, new, expected)) in cases.into_iter().enumerate() {
            let observed = ObjectMeta { annotations: existing, ..Default::default() };
            let mut desired = ObjectMeta { annotations: new, ..Default::default() };
            merge_kubectl_annotations(&mut desired, &observed);
            assert_eq!(desired.annotations, expected, "case {i}");
        }
    }
}
