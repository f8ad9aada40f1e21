// HTTP client for the upstream offline-message service.
use async_trait::async_trait;
use comet_common::Message;
use comet_store::{MessageStore, Result, StoreError};
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct SaveRequest<'a> {
    key: &'a str,
    message: &'a Message,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    items: Vec<Message>,
}

/// [`MessageStore`] backed by the message service's JSON API:
///
/// - `POST {base}/v1/messages` with `{key, message}`
/// - `GET {base}/v1/messages/{key}?since={id}` returning `{items}`
/// - `DELETE {base}/v1/messages/{key}`
#[derive(Debug, Clone)]
pub struct HttpMessageStore {
    client: Client,
    base: Url,
}

impl HttpMessageStore {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("message store url {base_url} cannot be a base");
        }
        Ok(Self { client, base })
    }

    fn messages_url(&self, key: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", "messages"]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        url
    }
}

fn unavailable(err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn save(&self, key: &str, message: &Message) -> Result<()> {
        let response = self
            .client
            .post(self.messages_url(None))
            .json(&SaveRequest { key, message })
            .send()
            .await
            .map_err(unavailable)?;
        check(response).await?;
        Ok(())
    }

    async fn get(&self, key: &str, since_id: i64) -> Result<Vec<Message>> {
        let response = self
            .client
            .get(self.messages_url(Some(key)))
            .query(&[("since", since_id)])
            .send()
            .await
            .map_err(unavailable)?;
        let body: MessagesResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(body.items)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.messages_url(Some(key)))
            .send()
            .await
            .map_err(unavailable)?;
        check(response).await?;
        Ok(())
    }
}
