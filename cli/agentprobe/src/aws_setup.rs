//! AWS SDK setup: region and credential resolution, client creation.

use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_bedrockagentcore::Client as AgentCoreClient;
use aws_sdk_cloudwatchlogs::Client as CwlClient;

pub struct AwsClients {
    pub cwl_client: CwlClient,
    pub agentcore_client: AgentCoreClient,
    pub region: Option<String>,
}

/// Loads the shared AWS configuration.
///
/// A region given here wins over the environment and profile; `us-east-1` is
/// the last resort.
pub async fn load_aws_config(aws_region: Option<&str>, aws_profile: Option<&str>) -> SdkConfig {
    let region_provider = RegionProviderChain::first_try(aws_region.map(|r| Region::new(r.to_string())))
        .or_default_provider()
        .or_else(Region::new("us-east-1"));

    let mut config_loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(profile) = aws_profile {
        config_loader = config_loader.profile_name(profile);
    }

    let aws_config = config_loader.load().await;
    tracing::debug!(region = ?aws_config.region(), profile = ?aws_profile, "Loaded AWS config.");
    aws_config
}

pub async fn setup_aws_clients(aws_region: Option<&str>, aws_profile: Option<&str>) -> AwsClients {
    let aws_config = load_aws_config(aws_region, aws_profile).await;

    let cwl_client = CwlClient::new(&aws_config);
    tracing::debug!("CloudWatch Logs client created.");
    let agentcore_client = AgentCoreClient::new(&aws_config);
    tracing::debug!("Bedrock AgentCore client created.");

    AwsClients {
        cwl_client,
        agentcore_client,
        region: aws_config.region().map(|r| r.to_string()),
    }
}
