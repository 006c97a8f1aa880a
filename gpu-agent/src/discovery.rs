//! Host identification for the GPU agent
//!
//! Resolves the Compute Engine project, zone and instance id from the
//! instance metadata server. Runs once at startup; the result labels every
//! reported time series.

use tracing::{debug, info};

use crate::error::MetadataError;

/// Header every metadata server request must carry
const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");

/// Identity of the VM running the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub project_id: String,
    pub zone: String,
    pub instance_id: String,
}

impl HostIdentity {
    /// Query the metadata server rooted at `metadata_url` (the `instance/` directory)
    pub async fn resolve(
        client: &reqwest::Client,
        metadata_url: &str,
    ) -> Result<Self, MetadataError> {
        debug!("Resolving host identity from {}", metadata_url);

        let zone_path = fetch_attribute(client, metadata_url, "zone").await?;
        let (project_id, zone) = parse_zone_path(&zone_path)?;

        let instance_id = fetch_attribute(client, metadata_url, "id")
            .await?
            .trim()
            .to_string();
        if instance_id.is_empty() || !instance_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MetadataError::MalformedInstanceId(instance_id));
        }

        let identity = HostIdentity {
            project_id,
            zone,
            instance_id,
        };

        info!(
            "Host identity resolved - project: {}, zone: {}, instance: {}",
            identity.project_id, identity.zone, identity.instance_id
        );
        Ok(identity)
    }
}

async fn fetch_attribute(
    client: &reqwest::Client,
    metadata_url: &str,
    attribute: &'static str,
) -> Result<String, MetadataError> {
    let url = format!("{}/{}", metadata_url.trim_end_matches('/'), attribute);

    let response = client
        .get(&url)
        .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
        .send()
        .await
        .map_err(|source| MetadataError::Request { attribute, source })?;

    let status = response.status();
    if !status.is_success() {
        return Err(MetadataError::Status { attribute, status });
    }

    response
        .text()
        .await
        .map_err(|source| MetadataError::Request { attribute, source })
}

/// Split `projects/<project>/zones/<zone>` into (project, zone)
pub fn parse_zone_path(path: &str) -> Result<(String, String), MetadataError> {
    let segments: Vec<&str> = path.trim().split('/').collect();

    match segments.as_slice() {
        [_, project, _, .., zone] if !project.is_empty() && !zone.is_empty() => {
            Ok((project.to_string(), zone.to_string()))
        }
        _ => Err(MetadataError::MalformedZone(path.to_string())),
    }
}
