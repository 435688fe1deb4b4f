//! Outbound dialing through the carrier REST API

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

/// Thin client for the carrier's call resource.
pub struct CarrierClient {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl CarrierClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.carrier.api_base.clone(),
            account_sid: config.carrier.account_sid.clone(),
            auth_token: config.carrier.auth_token.clone(),
            from_number: config.carrier.from_number.clone(),
        }
    }

    /// Place a call that connects its media to our stream WebSocket.
    /// Returns the carrier-side call id.
    pub async fn place_call(&self, to_number: &str, stream_url: &str) -> Result<String> {
        let twiml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{stream_url}"/></Connect></Response>"#
        );
        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to_number),
                ("From", self.from_number.as_str()),
                ("Twiml", twiml.as_str()),
            ])
            .send()
            .await
            .context("carrier dial request failed")?
            .error_for_status()
            .context("carrier rejected the dial request")?;

        let resource: CallResource = response.json().await.context("carrier dial response")?;
        info!("Outbound call placed: {}", resource.sid);
        Ok(resource.sid)
    }

    /// Hang up the PSTN leg.
    pub async fn terminate_call(&self, carrier_call_id: &str) -> Result<()> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, carrier_call_id
        );
        self.client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .context("carrier terminate request failed")?
            .error_for_status()
            .context("carrier rejected the terminate request")?;
        info!("Carrier call terminated: {carrier_call_id}");
        Ok(())
    }
}
