//! Default HTTP(S) strategy
//!
//! One GET per attempt, body streamed chunk by chunk into the transfer's
//! staging buffer.

use crate::engine::{FetchRequest, FetchStrategy, TransferContext};
use crate::error::{CacheError, Result};
use futures::StreamExt;
use reqwest::Client;
use rescache_types::{CacheSettings, ResponseMeta};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub struct HttpStrategy {
    client: Client,
}

impl HttpStrategy {
    pub fn new(settings: &CacheSettings) -> Result<Self> {
        let mut builder = Client::builder().user_agent(settings.user_agent.clone());
        if let Some(secs) = settings.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = settings.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(|e| CacheError::Network {
            status: None,
            message: e.to_string(),
        })?;
        Ok(Self { client })
    }

    /// Use a preconfigured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &str {
        "http"
    }

    fn can_handle(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn start(&self, transfer: TransferContext) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut transfer = transfer;
            let result = fetch(&client, &mut transfer).await;
            if let Err(e) = &result {
                warn!("Fetch of {} failed: {}", transfer.url(), e);
            }
            transfer.finish(result).await;
        });
    }
}

async fn fetch(client: &Client, transfer: &mut TransferContext) -> Result<()> {
    let mut request = FetchRequest::new(transfer.url().clone());
    transfer.will_send_request(&mut request);

    info!("Fetching {}", request.url);
    let token = transfer.token().clone();
    let send = client
        .get(request.url.clone())
        .headers(request.headers)
        .send();

    let response = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        response = send => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::http_status(status.as_u16(), transfer.url().as_str()));
    }

    transfer.set_response(ResponseMeta {
        status: status.as_u16(),
        final_url: response.url().to_string(),
        headers: response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    });

    let expected = response
        .content_length()
        .and_then(|len| i64::try_from(len).ok())
        .unwrap_or(-1);
    transfer.set_expected_length(expected);

    if let Some(content_type) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        transfer.set_content_type(content_type);
    }

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Fetch of {} cancelled", transfer.url());
                return Ok(());
            }
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => transfer.append(&chunk).await?,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    debug!("Fetched {} bytes from {}", transfer.downloaded_length(), transfer.url());
    Ok(())
}
