use std::time::Duration;

use reqwest::Method;

use crate::{config::with_scheme, err::DeliveryErr};

use super::ResultEnvelope;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the results of a job submitted with `return_url` are posted.
pub fn results_endpoint(return_url: &str) -> String {
    format!("{}/results", with_scheme(return_url.trim_end_matches('/')))
}

/// Posts result envelopes back to submitters. Each envelope is sent once.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

impl DeliveryClient {
    pub fn new() -> anyhow::Result<DeliveryClient> {
        let client = reqwest::Client::builder()
            .connect_timeout(DELIVERY_TIMEOUT)
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(DeliveryClient { client })
    }

    pub async fn deliver(
        &self,
        return_url: &str,
        envelope: &ResultEnvelope,
    ) -> Result<(), DeliveryErr> {
        let endpoint = results_endpoint(return_url);
        tracing::debug!("Delivering result to {}", endpoint);

        let req = self
            .client
            .request(Method::POST, &endpoint)
            .json(envelope)
            .build()?;
        let res = self.client.execute(req).await?;

        let status = res.status();
        if !status.is_success() {
            tracing::error!("Failed to deliver result to {}. Status: {}", endpoint, status);
            tracing::error!("Headers: {:#?}", res.headers());
            let body = res.text().await.unwrap_or_default();
            tracing::error!("body: {}", body);
            return Err(DeliveryErr::Status { status, body });
        }
        Ok(())
    }
}
