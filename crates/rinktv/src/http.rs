use std::{ops::Deref, sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN},
    Client, ClientBuilder, IntoUrl,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::{
    config::PipelineConfig,
    error::{RinkError, RinkResult},
    StreamDescriptor,
};

/// Client for the stream origin, carrying the session cookie.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> RinkResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    /// Client with the configured headers and the session cookie of `descriptor`.
    pub fn for_stream(config: &PipelineConfig, descriptor: &StreamDescriptor) -> RinkResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.8"));
        if let Some(origin) = &config.origin {
            if let Ok(origin) = HeaderValue::from_str(origin) {
                headers.insert(ORIGIN, origin);
            }
        }

        let client = Self::new(
            Client::builder()
                .default_headers(headers)
                .user_agent(config.user_agent())
                .timeout(Duration::from_secs(60)),
        )?;
        // without an explicit path the cookie would be scoped to the manifest directory
        client.add_cookies(
            vec![format!(
                "{}; Path=/",
                descriptor.session_cookie(&config.session_cookie)
            )],
            descriptor.stream_url.as_str(),
        )?;
        Ok(client)
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> RinkResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .map_err(|_| RinkError::ManifestFetchError("cookie store poisoned".to_string()))?;
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                tracing::warn!("Ignored invalid cookie for {url}: {e}");
            }
        }
        Ok(())
    }

    /// GET `url` as text, retrying up to `retries` times.
    pub async fn get_text(&self, url: &str, retries: u32) -> RinkResult<String> {
        let mut retry = retries.max(1);
        loop {
            let error = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(text) => return Ok(text),
                    Err(e) => RinkError::from(e),
                },
                Ok(resp) => RinkError::HttpError(resp.status()),
                Err(e) => RinkError::from(e),
            };

            retry -= 1;
            if retry == 0 {
                return Err(RinkError::ManifestFetchError(format!("{url}: {error}")));
            }
            tracing::warn!("Failed to fetch {url}, retry later. {error}");
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_session_cookie_is_sent() -> RinkResult<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/master_tablet60.m3u8"))
            .and(header("cookie", "mediaAuth=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U"))
            .mount(&server)
            .await;

        let url = format!("{}/master_tablet60.m3u8", server.uri());
        let descriptor = StreamDescriptor::new(1, url.clone(), "secret");
        let client = HttpClient::for_stream(&PipelineConfig::default(), &descriptor)?;
        assert_eq!(client.get_text(&url, 1).await?, "#EXTM3U");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_text_retries_then_fails() -> RinkResult<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.m3u8"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let client = HttpClient::new(Client::builder())?;
        let err = client
            .get_text(&format!("{}/gone.m3u8", server.uri()), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RinkError::ManifestFetchError(_)));
        Ok(())
    }
}
