//! Per-volume configuration decoded from the CSI volume context.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use super::tag::{TagError, TagGenerator};

pub const STAGE_IN_IMAGE_KEY: &str = "stage-in/image";
pub const STAGE_IN_TLS_VERIFY_KEY: &str = "stage-in/tlsVerify";
pub const STAGE_OUT_REPOSITORY_KEY: &str = "stage-out/repository";
pub const STAGE_OUT_TAG_GENERATOR_KEY: &str = "stage-out/tagGenerator";
pub const STAGE_OUT_TAG_GENERATOR_ARG_KEY: &str = "stage-out/tagGeneratorArg";
pub const STAGE_OUT_SQUASH_KEY: &str = "stage-out/squash";
pub const STAGE_OUT_TLS_VERIFY_KEY: &str = "stage-out/tlsVerify";

// Injected by the kubelet when the CSIDriver object sets podInfoOnMount.
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
pub const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";
pub const POD_SERVICE_ACCOUNT_KEY: &str = "csi.storage.k8s.io/serviceAccount.name";

/// Key the registry credentials must use in the CSI secrets map.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("volume ID not provided")]
    MissingVolumeId,

    #[error("target path not provided")]
    MissingTargetPath,

    #[error("{key} must be a boolean")]
    NotBoolean { key: &'static str },

    #[error("{key} is not set; the CSIDriver object must set spec.podInfoOnMount to true")]
    MissingPodInfo { key: &'static str },

    #[error("secrets were supplied without the .dockerconfigjson key")]
    MissingDockerConfigJson,

    #[error(transparent)]
    Tag(#[from] TagError),
}

/// The parsed per-volume configuration. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct StagerSpec {
    pub stage_in: StageInSpec,
    pub stage_out: StageOutSpec,
}

#[derive(Clone, Debug)]
pub struct StageInSpec {
    pub image: String,
    pub tls_verify: bool,
}

#[derive(Clone, Debug)]
pub struct StageOutSpec {
    pub enabled: bool,
    pub squash: bool,
    pub tls_verify: bool,
    pub image_repository: String,
    pub tag_generator: TagGenerator,
}

impl StagerSpec {
    pub fn parse(
        context: &BTreeMap<String, String>,
        default_stage_in_image: &str,
    ) -> Result<Self, SpecError> {
        Ok(StagerSpec {
            stage_in: StageInSpec::parse(context, default_stage_in_image)?,
            stage_out: StageOutSpec::parse(context)?,
        })
    }
}

impl StageInSpec {
    fn parse(
        context: &BTreeMap<String, String>,
        default_stage_in_image: &str,
    ) -> Result<Self, SpecError> {
        let image = context
            .get(STAGE_IN_IMAGE_KEY)
            .cloned()
            .unwrap_or_else(|| default_stage_in_image.to_owned());
        Ok(StageInSpec {
            image,
            tls_verify: parse_bool(context, STAGE_IN_TLS_VERIFY_KEY, true)?,
        })
    }
}

impl StageOutSpec {
    fn parse(context: &BTreeMap<String, String>) -> Result<Self, SpecError> {
        let image_repository = match context.get(STAGE_OUT_REPOSITORY_KEY) {
            Some(repository) => repository.clone(),
            None => {
                debug!(
                    "stage-out is disabled because {:?} is not set",
                    STAGE_OUT_REPOSITORY_KEY
                );
                return Ok(StageOutSpec {
                    enabled: false,
                    squash: false,
                    tls_verify: true,
                    image_repository: String::new(),
                    tag_generator: TagGenerator::Timestamp,
                });
            }
        };

        let generator_name = context
            .get(STAGE_OUT_TAG_GENERATOR_KEY)
            .map(String::as_str)
            .unwrap_or("timestamp");
        let generator_arg = context
            .get(STAGE_OUT_TAG_GENERATOR_ARG_KEY)
            .map(String::as_str)
            .unwrap_or("");

        Ok(StageOutSpec {
            enabled: true,
            squash: parse_bool(context, STAGE_OUT_SQUASH_KEY, false)?,
            tls_verify: parse_bool(context, STAGE_OUT_TLS_VERIFY_KEY, true)?,
            image_repository,
            tag_generator: TagGenerator::resolve(generator_name, generator_arg)?,
        })
    }
}

/// Pod attribution injected by the kubelet, used for tag templating and
/// event publication. All four keys are required.
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub service_account_name: String,
}

impl PodInfo {
    pub fn parse(context: &BTreeMap<String, String>) -> Result<Self, SpecError> {
        Ok(PodInfo {
            namespace: require_pod_key(context, POD_NAMESPACE_KEY)?,
            name: require_pod_key(context, POD_NAME_KEY)?,
            uid: require_pod_key(context, POD_UID_KEY)?,
            service_account_name: require_pod_key(context, POD_SERVICE_ACCOUNT_KEY)?,
        })
    }
}

fn require_pod_key(
    context: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<String, SpecError> {
    context
        .get(key)
        .cloned()
        .ok_or(SpecError::MissingPodInfo { key })
}

fn parse_bool(
    context: &BTreeMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, SpecError> {
    match context.get(key) {
        Some(raw) => raw.parse().map_err(|_| SpecError::NotBoolean { key }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_context_uses_defaults() {
        let spec = StagerSpec::parse(&context(&[]), "busybox:latest").expect("parse");
        assert_eq!(spec.stage_in.image, "busybox:latest");
        assert!(spec.stage_in.tls_verify);
        assert!(!spec.stage_out.enabled);
        assert!(!spec.stage_out.squash);
        assert!(spec.stage_out.tls_verify);
        assert_eq!(spec.stage_out.tag_generator, TagGenerator::Timestamp);
    }

    #[test]
    fn stage_in_image_overrides_the_default() {
        let spec = StagerSpec::parse(
            &context(&[(STAGE_IN_IMAGE_KEY, "alpine:3")]),
            "busybox:latest",
        )
        .expect("parse");
        assert_eq!(spec.stage_in.image, "alpine:3");
    }

    #[test]
    fn stage_in_tls_verify_parses() {
        let spec = StagerSpec::parse(
            &context(&[(STAGE_IN_TLS_VERIFY_KEY, "false")]),
            "busybox:latest",
        )
        .expect("parse");
        assert!(!spec.stage_in.tls_verify);
    }

    #[test]
    fn malformed_booleans_are_rejected() {
        for key in [
            STAGE_IN_TLS_VERIFY_KEY,
            STAGE_OUT_SQUASH_KEY,
            STAGE_OUT_TLS_VERIFY_KEY,
        ] {
            let mut entries = vec![(STAGE_OUT_REPOSITORY_KEY, "registry:5000/misc/misc")];
            entries.push((key, "yes"));
            match StagerSpec::parse(&context(&entries), "busybox:latest") {
                Err(SpecError::NotBoolean { key: bad }) => assert_eq!(bad, key),
                other => panic!("expected NotBoolean for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn repository_enables_stage_out_with_defaults() {
        let spec = StagerSpec::parse(
            &context(&[(STAGE_OUT_REPOSITORY_KEY, "registry:5000/misc/misc")]),
            "busybox:latest",
        )
        .expect("parse");
        assert!(spec.stage_out.enabled);
        assert_eq!(spec.stage_out.image_repository, "registry:5000/misc/misc");
        assert!(!spec.stage_out.squash);
        assert!(spec.stage_out.tls_verify);
        assert_eq!(spec.stage_out.tag_generator, TagGenerator::Timestamp);
    }

    #[test]
    fn tag_generator_and_arg_are_resolved_at_parse_time() {
        let spec = StagerSpec::parse(
            &context(&[
                (STAGE_OUT_REPOSITORY_KEY, "registry:5000/misc/misc"),
                (STAGE_OUT_TAG_GENERATOR_KEY, "fixed"),
                (STAGE_OUT_TAG_GENERATOR_ARG_KEY, "release"),
            ]),
            "busybox:latest",
        )
        .expect("parse");
        assert_eq!(
            spec.stage_out.tag_generator,
            TagGenerator::Fixed("release".to_owned())
        );
    }

    #[test]
    fn unknown_tag_generator_fails_parsing() {
        let result = StagerSpec::parse(
            &context(&[
                (STAGE_OUT_REPOSITORY_KEY, "registry:5000/misc/misc"),
                (STAGE_OUT_TAG_GENERATOR_KEY, "bogus"),
            ]),
            "busybox:latest",
        );
        assert!(matches!(result, Err(SpecError::Tag(_))));
    }

    #[test]
    fn pod_info_requires_every_key() {
        let full = [
            (POD_NAMESPACE_KEY, "test-ns"),
            (POD_NAME_KEY, "test-name"),
            (POD_UID_KEY, "uid-1"),
            (POD_SERVICE_ACCOUNT_KEY, "test-sa"),
        ];
        let info = PodInfo::parse(&context(&full)).expect("parse");
        assert_eq!(info.namespace, "test-ns");
        assert_eq!(info.name, "test-name");
        assert_eq!(info.uid, "uid-1");
        assert_eq!(info.service_account_name, "test-sa");

        for missing in 0..full.len() {
            let partial: Vec<_> = full
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, kv)| *kv)
                .collect();
            let err = PodInfo::parse(&context(&partial)).expect_err("should fail");
            assert!(
                err.to_string().contains("podInfoOnMount"),
                "error should tell the operator what to enable: {}",
                err
            );
        }
    }
}
