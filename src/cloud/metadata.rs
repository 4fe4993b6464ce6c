//! Identity of the worker host, read from the instance metadata service.

use crate::error::ShrinkResult;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const METADATA_URL: &str = "http://169.254.169.254/latest";
const TOKEN_TTL_SECONDS: &str = "21600";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHost {
    pub instance_id: String,
    pub availability_zone: String,
    pub region: String,
    /// Profile of the host, handed on to `--master` workers
    pub iam_instance_profile_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    instance_id: String,
    availability_zone: String,
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IamInfo {
    instance_profile_arn: String,
}

impl WorkerHost {
    /// Query IMDSv2 for the instance identity document and IAM profile.
    pub async fn discover() -> ShrinkResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        let token = client
            .put(format!("{METADATA_URL}/api/token"))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let document = client
            .get(format!("{METADATA_URL}/dynamic/instance-identity/document"))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let mut host = Self::from_identity_document(&document)?;

        let iam = client
            .get(format!("{METADATA_URL}/meta-data/iam/info"))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await?;
        if iam.status().is_success() {
            let info: IamInfo = iam.json().await?;
            host.iam_instance_profile_arn = Some(info.instance_profile_arn);
        } else {
            debug!("no IAM profile on worker host ({})", iam.status());
        }

        Ok(host)
    }

    pub fn from_identity_document(document: &str) -> ShrinkResult<Self> {
        let identity: IdentityDocument = serde_json::from_str(document)?;
        Ok(Self {
            instance_id: identity.instance_id,
            availability_zone: identity.availability_zone,
            region: identity.region,
            iam_instance_profile_arn: None,
        })
    }
}
