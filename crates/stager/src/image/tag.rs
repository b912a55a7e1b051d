//! Tag generation strategies for staged-out images.
//!
//! A strategy is resolved once at spec-parse time and evaluated when the
//! stage-out actually composes the image reference, so `Timestamp` reflects
//! the commit time rather than the volume's creation time.

use std::collections::BTreeMap;

use thiserror::Error;

use super::volume::Volume;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("unsupported tag generator {name:?}")]
    UnknownGenerator { name: String },

    #[error("tag template parse error: {0}")]
    TemplateParse(String),

    #[error("tag template references unknown variable {name:?}")]
    UnknownVariable { name: String },
}

/// A tag-naming strategy. Alias matching in [`TagGenerator::resolve`] is
/// case-sensitive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagGenerator {
    /// The literal argument.
    Fixed(String),
    /// The volume's id.
    VolumeId,
    /// The clock's wall time as decimal Unix seconds, evaluated at
    /// generation time.
    Timestamp,
    PodName,
    PodNamespace,
    PodUid,
    PodServiceAccount,
    /// The argument rendered as a `{{.variable}}` template.
    Template(String),
}

impl TagGenerator {
    pub fn resolve(name: &str, arg: &str) -> Result<Self, TagError> {
        match name {
            "fixed" => Ok(TagGenerator::Fixed(arg.to_owned())),
            "volumeId" | "volumdID" => Ok(TagGenerator::VolumeId),
            "timestamp" => Ok(TagGenerator::Timestamp),
            "podName" => Ok(TagGenerator::PodName),
            "podNamespace" => Ok(TagGenerator::PodNamespace),
            "podUid" | "podUID" => Ok(TagGenerator::PodUid),
            "podServiceAccount" => Ok(TagGenerator::PodServiceAccount),
            "template" => Ok(TagGenerator::Template(arg.to_owned())),
            _ => Err(TagError::UnknownGenerator {
                name: name.to_owned(),
            }),
        }
    }

    pub fn generate(&self, vol: &Volume) -> Result<String, TagError> {
        match self {
            TagGenerator::Fixed(tag) => Ok(tag.clone()),
            TagGenerator::VolumeId => Ok(vol.volume_id.clone()),
            TagGenerator::Timestamp => Ok(unix_seconds(vol)),
            TagGenerator::PodName => Ok(vol.pod_info.name.clone()),
            TagGenerator::PodNamespace => Ok(vol.pod_info.namespace.clone()),
            TagGenerator::PodUid => Ok(vol.pod_info.uid.clone()),
            TagGenerator::PodServiceAccount => Ok(vol.pod_info.service_account_name.clone()),
            TagGenerator::Template(template) => {
                render_template(template, &template_variables(vol))
            }
        }
    }
}

fn unix_seconds(vol: &Volume) -> String {
    vol.clock.now().timestamp().to_string()
}

fn template_variables(vol: &Volume) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("timestamp", unix_seconds(vol));
    vars.insert("volumeId", vol.volume_id.clone());
    vars.insert("volumeID", vol.volume_id.clone());
    vars.insert("podNamespace", vol.pod_info.namespace.clone());
    vars.insert("podName", vol.pod_info.name.clone());
    vars.insert("podUid", vol.pod_info.uid.clone());
    vars.insert("podUID", vol.pod_info.uid.clone());
    vars.insert("podServiceAccount", vol.pod_info.service_account_name.clone());
    vars
}

/// Renders `{{.variable}}` actions against the recognized variable set.
/// Text outside actions passes through verbatim. The variable set is
/// closed, so references outside it are errors rather than empty strings.
fn render_template(
    template: &str,
    vars: &BTreeMap<&'static str, String>,
) -> Result<String, TagError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TagError::TemplateParse("unterminated {{ action".to_owned()))?;
        let action = after[..end].trim();
        let name = action.strip_prefix('.').ok_or_else(|| {
            TagError::TemplateParse(format!(
                "expected a {{{{.variable}}}} reference, got {{{{{}}}}}",
                action
            ))
        })?;
        let value = vars.get(name).ok_or_else(|| TagError::UnknownVariable {
            name: name.to_owned(),
        })?;
        rendered.push_str(value);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}
