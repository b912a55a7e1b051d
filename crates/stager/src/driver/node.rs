use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_csi::v1_3_0::node_server::Node;
use k8s_csi::v1_3_0::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, Topology,
};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, error, trace};

use super::StagerService;
use crate::image::volume::Volume;

impl StagerService {
    /// Parses the request into a fresh volume and claims its id in the
    /// registry. The id stays claimed until unpublish (or a successful
    /// rollback) releases it, so a second publish under the same id fails
    /// fast.
    async fn init_volume(
        &self,
        request: &NodePublishVolumeRequest,
    ) -> Result<Arc<Mutex<Volume>>, Status> {
        let vol = Volume::new(
            request,
            self.state.clock.clone(),
            &self.state.default_stage_in_image,
        )
        .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let mut volumes = self.state.volumes.lock().await;
        if let Some(existing) = volumes.get(&vol.volume_id) {
            let phase = match existing.try_lock() {
                Ok(existing) => existing.phase.to_string(),
                // Another handler is driving it right now.
                Err(_) => "in flight".to_owned(),
            };
            return Err(Status::invalid_argument(format!(
                "volumeID={} has not been fully unpublished. phase={}",
                vol.volume_id, phase
            )));
        }
        let volume_id = vol.volume_id.clone();
        let vol = Arc::new(Mutex::new(vol));
        volumes.insert(volume_id, vol.clone());
        Ok(vol)
    }

    async fn get_volume(&self, volume_id: &str) -> Option<Arc<Mutex<Volume>>> {
        self.state.volumes.lock().await.get(volume_id).cloned()
    }

    async fn delete_volume(&self, volume_id: &str) {
        self.state.volumes.lock().await.remove(volume_id);
    }
}

#[tonic::async_trait]
impl Node for StagerService {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!(volume_id = %request.volume_id, "NodePublishVolume called");

        let vol = match self.init_volume(&request).await {
            Ok(vol) => vol,
            Err(status) => {
                error!(volume_id = %request.volume_id, error = %status.message(), "failed to initialize volume");
                return Err(status);
            }
        };
        let mut vol = vol.lock().await;
        debug!(volume_id = %vol.volume_id, "starting stage-in");

        if let Err(stage_err) = self.state.stager.stage_in(&mut vol).await {
            error!(
                volume_id = %vol.volume_id,
                phase = %vol.phase,
                error = %format!("{:#}", stage_err),
                "failed to stage-in. rolling back"
            );
            match self.state.stager.roll_back_stage_in(&mut vol).await {
                Ok(()) => {
                    debug!(volume_id = %vol.volume_id, "rollback succeeded");
                    let volume_id = vol.volume_id.clone();
                    drop(vol);
                    self.delete_volume(&volume_id).await;
                }
                Err(rollback_err) => {
                    // Deliberately left registered: the id stays claimed
                    // until an operator cleans up.
                    error!(
                        volume_id = %vol.volume_id,
                        phase = %vol.phase,
                        error = %format!("{:#}", rollback_err),
                        "failed to roll back; volume stays registered"
                    );
                }
            }
            return Err(Status::internal(format!("{:#}", stage_err)));
        }

        debug!(volume_id = %vol.volume_id, "stage-in succeeded");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!(volume_id = %request.volume_id, "NodeUnpublishVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let vol = self.get_volume(&request.volume_id).await.ok_or_else(|| {
            Status::invalid_argument(format!(
                "volumeID={} is not published on this node",
                request.volume_id
            ))
        })?;
        let mut vol = vol.lock().await;
        debug!(volume_id = %vol.volume_id, "starting stage-out");

        if let Err(err) = self.state.stager.stage_out(&mut vol).await {
            error!(
                volume_id = %vol.volume_id,
                phase = %vol.phase,
                error = %format!("{:#}", err),
                "failed to stage-out"
            );
            return Err(Status::internal(format!("{:#}", err)));
        }
        drop(vol);
        self.delete_volume(&request.volume_id).await;

        debug!(volume_id = %request.volume_id, "stage-out succeeded");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        trace!("NodeGetInfo called");
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.state.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology {
                segments: BTreeMap::new(),
            }),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        trace!("NodeGetCapabilities called");
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        trace!("NodeStageVolume called");
        Err(Status::unimplemented("stage/unstage not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        trace!("NodeUnstageVolume called");
        Err(Status::unimplemented("stage/unstage not supported"))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        trace!("NodeGetVolumeStats called");
        Err(Status::unimplemented("volume stats not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        trace!("NodeExpandVolume called");
        Err(Status::unimplemented("expand volume not supported"))
    }
}

#[cfg(test)]
mod test {
    use super::super::testing::test_service;
    use super::*;
    use crate::image::volume::testing::publish_request;
    use crate::image::volume::Phase;
    use crate::mount::testing::FakeMounter;
    use k8s_csi::v1_3_0::identity_server::Identity;
    use tempfile::TempDir;

    #[tokio::test]
    async fn publish_registers_and_reaches_published() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect("publish should succeed");

        let vol = service
            .get_volume("vol-1")
            .await
            .expect("volume should be registered");
        assert_eq!(vol.lock().await.phase, Phase::Published);
    }

    #[tokio::test]
    async fn duplicate_publish_cites_the_existing_phase() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect("first publish should succeed");

        let status = service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect_err("second publish should fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(
            status.message().contains("Published"),
            "message should cite the phase: {}",
            status.message()
        );
    }

    #[tokio::test]
    async fn publish_with_bad_spec_is_invalid_argument() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        // Pod info keys are absent entirely.
        let request = NodePublishVolumeRequest {
            volume_id: "vol-1".to_owned(),
            target_path: "/tmp/target".to_owned(),
            ..Default::default()
        };
        let status = service
            .node_publish_volume(Request::new(request))
            .await
            .expect_err("publish should fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(service.get_volume("vol-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_stage_in_rolls_back_and_deregisters() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(
            &dir,
            "",
            Arc::new(FakeMounter {
                fail_bind_mount: true,
                ..Default::default()
            }),
        );

        let status = service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect_err("publish should fail");
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(
            service.get_volume("vol-1").await.is_none(),
            "rollback success must release the volume id"
        );

        // The id is reusable again.
        service
            .node_publish_volume(Request::new(publish_request("vol-2", "/tmp/target", &[])))
            .await
            .expect("an unrelated publish should still work");
    }

    #[tokio::test]
    async fn failed_rollback_leaves_the_volume_registered() {
        let dir = TempDir::new().expect("tempdir");
        // Bind mount fails, and the rollback's buildah umount fails too.
        let service = test_service(
            &dir,
            "umount) exit 1 ;;",
            Arc::new(FakeMounter {
                fail_bind_mount: true,
                ..Default::default()
            }),
        );

        let status = service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect_err("publish should fail");
        assert_eq!(status.code(), tonic::Code::Internal);

        let vol = service
            .get_volume("vol-1")
            .await
            .expect("volume must stay registered for operator intervention");
        assert_eq!(vol.lock().await.phase, Phase::ContainerMounted);

        // Re-publishing the same id keeps failing until the operator acts.
        let status = service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect_err("re-publish should fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unpublish_requires_a_known_volume() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        let status = service
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "vol-unknown".to_owned(),
                target_path: "/tmp/target".to_owned(),
            }))
            .await
            .expect_err("unpublish of an unknown id should fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: String::new(),
                target_path: "/tmp/target".to_owned(),
            }))
            .await
            .expect_err("unpublish without an id should fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn publish_then_unpublish_releases_the_id() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect("publish should succeed");
        service
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "vol-1".to_owned(),
                target_path: "/tmp/target".to_owned(),
            }))
            .await
            .expect("unpublish should succeed");
        assert!(service.get_volume("vol-1").await.is_none());

        // The id can be published again from scratch.
        service
            .node_publish_volume(Request::new(publish_request("vol-1", "/tmp/target", &[])))
            .await
            .expect("re-publish after unpublish should succeed");
    }

    #[tokio::test]
    async fn failed_stage_out_leaves_the_volume_registered() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "push) exit 1 ;;", Arc::new(FakeMounter::default()));

        service
            .node_publish_volume(Request::new(publish_request(
                "vol-1",
                "/tmp/target",
                &[("stage-out/repository", "registry:5000/misc/misc")],
            )))
            .await
            .expect("publish should succeed");

        let status = service
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "vol-1".to_owned(),
                target_path: "/tmp/target".to_owned(),
            }))
            .await
            .expect_err("unpublish should fail at push");
        assert_eq!(status.code(), tonic::Code::Internal);

        let vol = service
            .get_volume("vol-1")
            .await
            .expect("volume must stay registered for retry");
        assert_eq!(vol.lock().await.phase, Phase::ContainerUnMounted);
    }

    #[tokio::test]
    async fn identity_reports_name_version_and_capabilities() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        let info = service
            .get_plugin_info(Request::new(k8s_csi::v1_3_0::GetPluginInfoRequest {}))
            .await
            .expect("GetPluginInfo")
            .into_inner();
        assert_eq!(info.name, super::super::DRIVER_NAME);
        assert_eq!(info.vendor_version, "0.0.0-test");

        let capabilities = service
            .get_plugin_capabilities(Request::new(
                k8s_csi::v1_3_0::GetPluginCapabilitiesRequest {},
            ))
            .await
            .expect("GetPluginCapabilities")
            .into_inner()
            .capabilities;
        let expected = k8s_csi::v1_3_0::plugin_capability::service::Type::VolumeAccessibilityConstraints
            as i32;
        assert!(capabilities.iter().any(|capability| matches!(
            &capability.r#type,
            Some(k8s_csi::v1_3_0::plugin_capability::Type::Service(service))
                if service.r#type == expected
        )));

        service
            .probe(Request::new(k8s_csi::v1_3_0::ProbeRequest {}))
            .await
            .expect("Probe");
    }

    #[tokio::test]
    async fn node_get_info_reports_the_node_id() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        let info = service
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .expect("NodeGetInfo")
            .into_inner();
        assert_eq!(info.node_id, "test-node");
    }

    #[tokio::test]
    async fn unsupported_node_rpcs_are_unimplemented() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        let status = service
            .node_stage_volume(Request::new(NodeStageVolumeRequest::default()))
            .await
            .expect_err("NodeStageVolume");
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status = service
            .node_unstage_volume(Request::new(NodeUnstageVolumeRequest::default()))
            .await
            .expect_err("NodeUnstageVolume");
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status = service
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest::default()))
            .await
            .expect_err("NodeGetVolumeStats");
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status = service
            .node_expand_volume(Request::new(NodeExpandVolumeRequest::default()))
            .await
            .expect_err("NodeExpandVolume");
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn distinct_volume_ids_stage_in_parallel() {
        let dir = TempDir::new().expect("tempdir");
        let service = test_service(&dir, "", Arc::new(FakeMounter::default()));

        let first = service.node_publish_volume(Request::new(publish_request(
            "vol-a",
            "/tmp/target-a",
            &[],
        )));
        let second = service.node_publish_volume(Request::new(publish_request(
            "vol-b",
            "/tmp/target-b",
            &[],
        )));
        let (first, second) = tokio::join!(first, second);
        first.expect("vol-a publish");
        second.expect("vol-b publish");

        assert!(service.get_volume("vol-a").await.is_some());
        assert!(service.get_volume("vol-b").await.is_some());
    }
}
