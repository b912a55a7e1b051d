//! The stage-in/stage-out state machine.
//!
//! A [`Stager`] drives a [`Volume`](volume::Volume) forward one phase at a
//! time by composing buildah and mount operations. Each step performs its
//! side effect and then advances exactly one phase (the documented
//! stage-out shortcut excepted), so a failure leaves the phase at the last
//! completed state and rollback can undo precisely what was done.

pub mod clock;
pub mod events;
pub mod spec;
pub mod tag;
pub mod volume;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::buildah;
use crate::mount::{MountOption, Mounter};
use self::events::EventRecorder;
use self::volume::{Phase, Volume};

pub struct Stager {
    pub buildah: buildah::Client,
    pub mounter: Arc<dyn Mounter>,
    /// Cadence of the builder garbage collection loop. Zero disables it.
    pub gc_period: Duration,
    /// Optional pod Event sink; without one, events are skipped.
    pub recorder: Option<EventRecorder>,
}

impl Stager {
    /// Drives a volume from its current phase to `Published`.
    ///
    /// Calling this on an already published volume is a no-op. A buildah
    /// container already named after the volume (left behind by a crash
    /// between create and mount) is adopted instead of recreated.
    pub async fn stage_in(&self, vol: &mut Volume) -> anyhow::Result<()> {
        loop {
            match vol.phase {
                Phase::InitState => {
                    let exists = self
                        .buildah
                        .container_exists(&vol.volume_id)
                        .await
                        .with_context(|| {
                            format!(
                                "check buildah container(name={}) existence failed",
                                vol.volume_id
                            )
                        })?;
                    if exists {
                        debug!(volume_id = %vol.volume_id, "buildah container already exists, adopting it");
                        vol.phase = Phase::ContainerCreated;
                        continue;
                    }

                    self.publish_event(
                        vol,
                        "StageInStarted",
                        format!(
                            "volumeID={} image={}",
                            vol.volume_id, vol.spec.stage_in.image
                        ),
                    )
                    .await;
                    if let Err(err) = self
                        .buildah
                        .from(
                            &vol.volume_id,
                            &vol.spec.stage_in.image,
                            vol.docker_config_json.as_deref(),
                            vol.spec.stage_in.tls_verify,
                        )
                        .await
                    {
                        self.publish_event(
                            vol,
                            "StageInFailed",
                            format!(
                                "volumeID={} image={} error={}",
                                vol.volume_id, vol.spec.stage_in.image, err
                            ),
                        )
                        .await;
                        return Err(err).with_context(|| {
                            format!("can't create buildah container(name={})", vol.volume_id)
                        });
                    }
                    self.publish_event(
                        vol,
                        "StageInSucceeded",
                        format!(
                            "volumeID={} image={}",
                            vol.volume_id, vol.spec.stage_in.image
                        ),
                    )
                    .await;
                    vol.phase = Phase::ContainerCreated;
                }

                Phase::ContainerCreated => {
                    let root = self.buildah.mount(&vol.volume_id).await.with_context(|| {
                        format!("can't mount buildah container(name={})", vol.volume_id)
                    })?;
                    vol.provisioned_root = Some(root);
                    vol.phase = Phase::ContainerMounted;
                }

                Phase::ContainerMounted => {
                    let mut options = vec![MountOption::Bind];
                    if vol.read_only {
                        options.push(MountOption::ReadOnly);
                    }
                    let root = vol.provisioned_root.clone().ok_or_else(|| {
                        anyhow::anyhow!(
                            "no provisioned root recorded for volume(volumeID={})",
                            vol.volume_id
                        )
                    })?;
                    self.mounter
                        .bind_mount(&root, &vol.target_path, &options)
                        .with_context(|| {
                            format!(
                                "can't mount buildah container(name={})'s provisioned root(={}) to volume targetPath(={})",
                                vol.volume_id,
                                root.display(),
                                vol.target_path.display()
                            )
                        })?;
                    vol.phase = Phase::TargetPathMounted;
                }

                Phase::TargetPathMounted => {
                    vol.phase = Phase::Published;
                }

                Phase::Published => return Ok(()),

                other => anyhow::bail!(
                    "internal error in publishing volume. volumeID={}, phase={}",
                    vol.volume_id,
                    other
                ),
            }
        }
    }

    /// Unwinds a failed stage-in back to `InitState`, undoing one step per
    /// phase. A failing undo step leaves the phase where it was so the
    /// caller can keep the volume registered for operator intervention.
    pub async fn roll_back_stage_in(&self, vol: &mut Volume) -> anyhow::Result<()> {
        loop {
            match vol.phase {
                Phase::InitState => return Ok(()),

                Phase::ContainerCreated => {
                    self.buildah.delete(&vol.volume_id).await.with_context(|| {
                        format!("can't delete buildah container(name={})", vol.volume_id)
                    })?;
                    vol.phase = Phase::InitState;
                }

                Phase::ContainerMounted => {
                    self.buildah.umount(&vol.volume_id).await.with_context(|| {
                        format!("can't umount buildah container(name={})", vol.volume_id)
                    })?;
                    vol.provisioned_root = None;
                    vol.phase = Phase::ContainerCreated;
                }

                Phase::TargetPathMounted => {
                    self.mounter.unmount(&vol.target_path).with_context(|| {
                        format!(
                            "can't unmount volume(volumeID={}) targetPath(={})",
                            vol.volume_id,
                            vol.target_path.display()
                        )
                    })?;
                    vol.phase = Phase::ContainerMounted;
                }

                other => anyhow::bail!(
                    "internal error in rolling back volume publishing. volumeID={}, phase={}",
                    vol.volume_id,
                    other
                ),
            }
        }
    }

    /// Drives a published volume through teardown to `UnPublished`. With
    /// stage-out enabled the workload's root is committed, pushed and the
    /// container deleted; otherwise the commit/push leg is skipped and only
    /// the container is deleted.
    pub async fn stage_out(&self, vol: &mut Volume) -> anyhow::Result<()> {
        loop {
            match vol.phase {
                Phase::Published => {
                    self.mounter.unmount(&vol.target_path).with_context(|| {
                        format!(
                            "can't unmount volume(volumeID={}) targetPath(={})",
                            vol.volume_id,
                            vol.target_path.display()
                        )
                    })?;
                    vol.phase = Phase::TargetPathUnMounted;
                }

                Phase::TargetPathUnMounted => {
                    if !vol.spec.stage_out.enabled {
                        vol.provisioned_root = None;
                        vol.phase = Phase::ContainerImagePushed;
                        continue;
                    }
                    let tag = vol
                        .spec
                        .stage_out
                        .tag_generator
                        .generate(vol)
                        .context("failed to generate image tag to stage out")?;
                    let image = format!("{}:{}", vol.spec.stage_out.image_repository, tag);
                    self.buildah
                        .commit(&vol.volume_id, &image, vol.spec.stage_out.squash)
                        .await
                        .with_context(|| {
                            format!("can't commit buildah container(name={})", vol.volume_id)
                        })?;
                    vol.image_to_push = Some(image);
                    vol.phase = Phase::ContainerCommitted;
                }

                Phase::ContainerCommitted => {
                    self.buildah.umount(&vol.volume_id).await.with_context(|| {
                        format!("can't umount buildah container(name={})", vol.volume_id)
                    })?;
                    vol.phase = Phase::ContainerUnMounted;
                }

                Phase::ContainerUnMounted => {
                    let image = vol.image_to_push.clone().ok_or_else(|| {
                        anyhow::anyhow!(
                            "no image recorded to push for volume(volumeID={})",
                            vol.volume_id
                        )
                    })?;
                    if let Err(err) = self
                        .buildah
                        .push(
                            &vol.volume_id,
                            &image,
                            vol.docker_config_json.as_deref(),
                            vol.spec.stage_out.tls_verify,
                        )
                        .await
                    {
                        self.publish_event(
                            vol,
                            "StageOutFailed",
                            format!(
                                "volumeID={} image={} error={}",
                                vol.volume_id, image, err
                            ),
                        )
                        .await;
                        return Err(err)
                            .with_context(|| format!("can't push image(={})", image));
                    }
                    self.publish_event(
                        vol,
                        "StageOutSucceeded",
                        format!("volumeID={} image={}", vol.volume_id, image),
                    )
                    .await;
                    vol.provisioned_root = None;
                    vol.phase = Phase::ContainerImagePushed;
                }

                Phase::ContainerImagePushed => {
                    self.buildah.delete(&vol.volume_id).await.with_context(|| {
                        format!("can't delete buildah container(name={})", vol.volume_id)
                    })?;
                    vol.phase = Phase::ContainerDeleted;
                }

                Phase::ContainerDeleted => {
                    vol.phase = Phase::UnPublished;
                }

                Phase::UnPublished => return Ok(()),

                other => anyhow::bail!(
                    "internal error in unpublishing volume. volumeID={}, phase={}",
                    vol.volume_id,
                    other
                ),
            }
        }
    }

    /// Spawns the periodic builder garbage collection task, or returns
    /// `None` when the period is zero. The task runs for the life of the
    /// process; each tick is bounded by the client's GC timeout and never
    /// fails the loop.
    pub fn start_garbage_collection(&self) -> Option<JoinHandle<()>> {
        if self.gc_period.is_zero() {
            info!("buildah garbage collector disabled");
            return None;
        }
        info!(period = ?self.gc_period, "starting buildah garbage collector");
        let client = self.buildah.clone();
        let period = self.gc_period;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                client.gc_once().await;
            }
        }))
    }

    async fn publish_event(&self, vol: &Volume, reason: &str, message: String) {
        match &self.recorder {
            Some(recorder) => recorder.publish(&vol.pod_info, reason, message).await,
            None => {
                debug!(volume_id = %vol.volume_id, reason, "no event recorder configured, skipping event")
            }
        }
    }
}
