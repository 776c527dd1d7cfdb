//! Provider construction from configuration.

use std::sync::Arc;

use cost::providers::{
    AwsCostProvider, CostProvider, CostProviderError, GcpCostProvider, ServersComCostProvider,
};
use tracing::{error, info};

use crate::config::Cli;

/// Build every provider the configuration allows.
///
/// Disabled providers are kept so their jobs log that they are off. A
/// provider whose configuration is invalid is left out; the rest still run.
pub fn build_providers(cli: &Cli) -> Vec<Arc<dyn CostProvider>> {
    let candidates: [(&str, Result<Arc<dyn CostProvider>, CostProviderError>); 3] = [
        (
            "aws",
            AwsCostProvider::new(cli.aws_config()).map(|p| Arc::new(p) as Arc<dyn CostProvider>),
        ),
        (
            "gcp",
            cli.gcp_config()
                .and_then(GcpCostProvider::new)
                .map(|p| Arc::new(p) as Arc<dyn CostProvider>),
        ),
        (
            "serverscom",
            ServersComCostProvider::new(cli.serverscom_config())
                .map(|p| Arc::new(p) as Arc<dyn CostProvider>),
        ),
    ];

    candidates
        .into_iter()
        .filter_map(|(name, result)| match result {
            Ok(provider) => {
                info!(provider = name, enabled = provider.is_enabled(), "Configured provider");
                Some(provider)
            }
            Err(e) => {
                error!(provider = name, error = %e, "Invalid provider configuration, not scheduling it");
                None
            }
        })
        .collect()
}
