//! Best-effort publication of pod Events for stage-in/stage-out progress.

use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use tracing::{debug, warn};

use super::spec::PodInfo;

/// Publishes normal-type Events against the pod a volume belongs to, so
/// stage-in/stage-out progress shows up in `kubectl describe pod`.
/// Publication is advisory: failures are logged and dropped.
#[derive(Clone)]
pub struct EventRecorder {
    client: kube::Client,
    component: String,
}

impl EventRecorder {
    pub fn new(client: kube::Client, component: impl Into<String>) -> Self {
        EventRecorder {
            client,
            component: component.into(),
        }
    }

    pub async fn publish(&self, pod: &PodInfo, reason: &str, message: String) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &pod.namespace);
        let now = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                // Unique per emission, the same shape client-go's recorder
                // uses.
                name: Some(format!(
                    "{}.{:x}",
                    pod.name,
                    now.timestamp_nanos_opt().unwrap_or_default()
                )),
                namespace: Some(pod.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_owned()),
                kind: Some("Pod".to_owned()),
                name: Some(pod.name.clone()),
                namespace: Some(pod.namespace.clone()),
                uid: Some(pod.uid.clone()),
                ..Default::default()
            },
            reason: Some(reason.to_owned()),
            message: Some(message),
            type_: Some("Normal".to_owned()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            reporting_component: Some(self.component.clone()),
            ..Default::default()
        };
        match events.create(&PostParams::default(), &event).await {
            Ok(_) => debug!(pod = %pod.name, reason, "published event"),
            Err(error) => warn!(%error, pod = %pod.name, reason, "can't publish event"),
        }
    }
}
