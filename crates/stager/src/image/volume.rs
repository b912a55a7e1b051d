//! The runtime state of a single staged volume.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_csi::v1_3_0::NodePublishVolumeRequest;

use super::clock::Clock;
use super::spec::{PodInfo, SpecError, StagerSpec, DOCKER_CONFIG_JSON_KEY};

/// Lifecycle phase of a volume. Phases advance one step at a time along two
/// chains joined at `Published`:
///
/// ```text
/// InitState -> ContainerCreated -> ContainerMounted -> TargetPathMounted -> Published
/// Published -> TargetPathUnMounted -> (ContainerCommitted -> ContainerUnMounted ->)?
///              ContainerImagePushed -> ContainerDeleted -> UnPublished
/// ```
///
/// The parenthesized commit/push leg is skipped when stage-out is disabled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    InitState,
    ContainerCreated,
    ContainerMounted,
    TargetPathMounted,
    Published,
    TargetPathUnMounted,
    ContainerCommitted,
    ContainerUnMounted,
    ContainerImagePushed,
    ContainerDeleted,
    UnPublished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::InitState => "InitState",
            Phase::ContainerCreated => "ContainerCreated",
            Phase::ContainerMounted => "ContainerMounted",
            Phase::TargetPathMounted => "TargetPathMounted",
            Phase::Published => "Published",
            Phase::TargetPathUnMounted => "TargetPathUnMounted",
            Phase::ContainerCommitted => "ContainerCommitted",
            Phase::ContainerUnMounted => "ContainerUnMounted",
            Phase::ContainerImagePushed => "ContainerImagePushed",
            Phase::ContainerDeleted => "ContainerDeleted",
            Phase::UnPublished => "UnPublished",
        };
        f.write_str(name)
    }
}

/// One staged volume: its identity and parsed spec plus the mutable state
/// the stager advances. The volume id doubles as the buildah container
/// name, which is what makes crash recovery at `InitState` possible.
pub struct Volume {
    pub clock: Arc<dyn Clock>,

    pub spec: StagerSpec,

    // Values from the publish request.
    pub volume_id: String,
    pub target_path: PathBuf,
    pub read_only: bool,
    pub docker_config_json: Option<String>,
    pub pod_info: PodInfo,

    // Runtime state.
    pub phase: Phase,
    /// Set while the buildah container is mounted; the root the workload's
    /// target path is bound to.
    pub provisioned_root: Option<PathBuf>,
    /// Set once stage-out has committed; always `{repository}:{tag}`.
    pub image_to_push: Option<String>,
}

impl Volume {
    pub fn new(
        req: &NodePublishVolumeRequest,
        clock: Arc<dyn Clock>,
        default_stage_in_image: &str,
    ) -> Result<Self, SpecError> {
        if req.volume_id.is_empty() {
            return Err(SpecError::MissingVolumeId);
        }
        if req.target_path.is_empty() {
            return Err(SpecError::MissingTargetPath);
        }

        let docker_config_json = if req.secrets.is_empty() {
            None
        } else {
            Some(
                req.secrets
                    .get(DOCKER_CONFIG_JSON_KEY)
                    .cloned()
                    .ok_or(SpecError::MissingDockerConfigJson)?,
            )
        };

        let pod_info = PodInfo::parse(&req.volume_context)?;
        let spec = StagerSpec::parse(&req.volume_context, default_stage_in_image)?;

        Ok(Volume {
            clock,
            spec,
            volume_id: req.volume_id.clone(),
            target_path: PathBuf::from(&req.target_path),
            read_only: req.readonly,
            docker_config_json,
            pod_info,
            phase: Phase::InitState,
            provisioned_root: None,
            image_to_push: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::super::clock::FixedClock;
    use super::super::spec::{
        POD_NAMESPACE_KEY, POD_NAME_KEY, POD_SERVICE_ACCOUNT_KEY, POD_UID_KEY, STAGE_IN_IMAGE_KEY,
    };
    use super::*;
    use chrono::TimeZone;

    /// A publish request with the standard test pod attribution; the pod
    /// uid is the volume id, mirroring how the e2e suite drives buildah.
    pub(crate) fn publish_request(
        volume_id: &str,
        target_path: &str,
        extra_context: &[(&str, &str)],
    ) -> NodePublishVolumeRequest {
        let mut context: Vec<(String, String)> = vec![
            (STAGE_IN_IMAGE_KEY.to_owned(), "busybox".to_owned()),
            (POD_NAMESPACE_KEY.to_owned(), "test-ns".to_owned()),
            (POD_NAME_KEY.to_owned(), "test-name".to_owned()),
            (POD_UID_KEY.to_owned(), volume_id.to_owned()),
            (POD_SERVICE_ACCOUNT_KEY.to_owned(), "test-sa".to_owned()),
        ];
        context.extend(
            extra_context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        NodePublishVolumeRequest {
            volume_id: volume_id.to_owned(),
            target_path: target_path.to_owned(),
            volume_context: context.into_iter().collect(),
            ..Default::default()
        }
    }

    pub(crate) fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            chrono::Utc.timestamp_opt(1_577_836_800, 0).unwrap(),
        ))
    }

    pub(crate) fn test_volume(volume_id: &str, extra_context: &[(&str, &str)]) -> Volume {
        let req = publish_request(volume_id, "/tmp/target", extra_context);
        Volume::new(&req, fixed_clock(), "busybox:latest").expect("test volume should parse")
    }
}
