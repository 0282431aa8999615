use std::marker::PhantomData;
use std::time::Duration;

use fanout::error::FetchError;
use fanout::fetcher::Fetcher;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Fetcher resolving an identifier to the JSON document at `{base_url}/{identifier}`.
///
/// Only a `200 OK` response with a non-empty body that decodes into `T` is a success.
#[derive(Debug)]
pub struct HttpFetcher<T> {
    client: reqwest::Client,
    base_url: Url,
    _output: PhantomData<fn() -> T>,
}

impl<T> HttpFetcher<T> {
    /// Creates a fetcher for the resources under `base_url`.
    pub fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("{base_url} cannot be used as a base url");
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            _output: PhantomData,
        })
    }

    /// Appends `identifier` to the base url as one percent-encoded path segment.
    fn resource_url(&self, identifier: &str) -> Result<Url, FetchError> {
        let invalid = || FetchError::InvalidIdentifier(identifier.to_owned());

        let is_segment = !identifier.is_empty()
            && identifier != "."
            && identifier != ".."
            && !identifier.contains(['/', '?', '#', '\\', ':']);
        if !is_segment {
            return Err(invalid());
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push(identifier);

        let base = self.base_url.as_str().trim_end_matches('/');
        if !url.as_str().starts_with(base) {
            return Err(invalid());
        }

        Ok(url)
    }
}

impl<T> Fetcher for HttpFetcher<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = String;
    type Output = T;

    fn name() -> &'static str {
        "http"
    }

    async fn fetch(&self, identifier: String) -> Result<T, FetchError> {
        let url = self.resource_url(&identifier)?;
        debug!(%url, "requesting resource");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        }

        let body = response.bytes().await.map_err(FetchError::transport)?;
        if body.is_empty() {
            return Err(FetchError::EmptyData);
        }

        serde_json::from_slice(&body).map_err(|err| FetchError::DecodeFailure(err.to_string()))
    }
}
