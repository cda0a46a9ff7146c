//! HTTP API client for initial conversation/message hydration

use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{Conversation, Message};

/// One page of a paginated listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        (self.page as u64) * (self.per_page as u64) < self.total
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    pub fn clear_token(&self) {
        *self.token.lock() = None;
    }

    fn auth_header(&self) -> Option<String> {
        self.token.lock().as_ref().map(|t| format!("Bearer {}", t))
    }

    pub async fn fetch_conversations(&self, page: u32, per_page: u32) -> Result<Page<Conversation>> {
        let auth = self.auth_header().ok_or(Error::NotAuthenticated)?;

        let endpoint = format!("{}/api/v1/conversations", self.base_url);
        let resp = self
            .client
            .get(&endpoint)
            .query(&[("page", page), ("per_page", per_page)])
            .header("Authorization", auth)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::UnexpectedStatus {
                endpoint,
                status: resp.status().as_u16(),
            });
        }

        let page: Page<Conversation> = resp.json().await?;
        Ok(page)
    }

    pub async fn fetch_messages(
        &self,
        conversation_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Message>> {
        let auth = self.auth_header().ok_or(Error::NotAuthenticated)?;

        let endpoint = format!(
            "{}/api/v1/conversations/{}/messages",
            self.base_url, conversation_id
        );
        let resp = self
            .client
            .get(&endpoint)
            .query(&[("page", page), ("per_page", per_page)])
            .header("Authorization", auth)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Error::UnexpectedStatus {
                endpoint,
                status: resp.status().as_u16(),
            });
        }

        let page: Page<Message> = resp.json().await?;
        Ok(page)
    }
}
