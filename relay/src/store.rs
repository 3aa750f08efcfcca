//! HTTP client for the external project/file/conversation store.
//!
//! Every call presents the shared internal key; a missing key fails
//! closed before any request leaves the process. Responses map onto the
//! error taxonomy by status class: auth failures and missing entities are
//! non-retriable, server-side trouble is transient, and the remaining
//! client errors carry the store's own message (duplicate names and the
//! like) so tools can surface them to the agent.

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use relay_sdk::{
    async_trait, Conversation, EngineError, FileId, MessageId, MessageStatus, NewMessage,
    ProjectFile, ProjectStore, StoredMessage,
};

const INTERNAL_KEY_HEADER: &str = "x-internal-key";

pub struct HttpProjectStore {
    client: Client,
    base_url: String,
    internal_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedId {
    id: String,
}

impl HttpProjectStore {
    pub fn new(base_url: impl Into<String>, internal_key: Option<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::new(),
            base_url,
            internal_key,
        }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, EngineError> {
        let key = self
            .internal_key
            .as_deref()
            .ok_or_else(|| EngineError::Config("missing internal key".to_string()))?;
        Ok(self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header(INTERNAL_KEY_HEADER, key))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, EngineError> {
        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        self.check(response).await
    }

    async fn check(&self, response: Response) -> Result<Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::Unauthorized,
            StatusCode::NOT_FOUND => EngineError::NotFound(message),
            status if status.is_server_error() => EngineError::StoreUnavailable(message),
            status => EngineError::StoreRejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, EngineError> {
        response
            .json()
            .await
            .map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        let request = self.request(Method::GET, &format!("/conversations/{conversation_id}"))?;
        let response = self.send(request).await?;
        self.decode(response).await
    }

    async fn message(&self, message_id: &str) -> Result<StoredMessage, EngineError> {
        let request = self.request(Method::GET, &format!("/messages/{message_id}"))?;
        let response = self.send(request).await?;
        self.decode(response).await
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let request = self
            .request(
                Method::GET,
                &format!("/conversations/{conversation_id}/messages"),
            )?
            .query(&[("limit", limit)]);
        let response = self.send(request).await?;
        self.decode(response).await
    }

    async fn create_message(&self, message: NewMessage) -> Result<MessageId, EngineError> {
        let request = self.request(Method::POST, "/messages")?.json(&message);
        let response = self.send(request).await?;
        let created: CreatedId = self.decode(response).await?;
        Ok(created.id)
    }

    async fn patch_message(
        &self,
        message_id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError> {
        let request = self
            .request(Method::PATCH, &format!("/messages/{message_id}"))?
            .json(&json!({ "content": content, "status": status }));
        self.send(request).await?;
        Ok(())
    }

    async fn patch_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError> {
        let request = self
            .request(Method::PATCH, &format!("/messages/{message_id}"))?
            .json(&json!({ "status": status }));
        self.send(request).await?;
        Ok(())
    }

    async fn patch_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), EngineError> {
        let request = self
            .request(
                Method::PATCH,
                &format!("/conversations/{conversation_id}/title"),
            )?
            .json(&json!({ "title": title }));
        self.send(request).await?;
        Ok(())
    }

    async fn file(&self, file_id: &str) -> Result<ProjectFile, EngineError> {
        let request = self.request(Method::GET, &format!("/files/{file_id}"))?;
        let response = self.send(request).await?;
        self.decode(response).await
    }

    async fn folder_contents(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<ProjectFile>, EngineError> {
        let mut request = self.request(Method::GET, &format!("/projects/{project_id}/files"))?;
        if let Some(parent_id) = parent_id {
            request = request.query(&[("parent", parent_id)]);
        }
        let response = self.send(request).await?;
        self.decode(response).await
    }

    async fn create_file(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
        content: &str,
    ) -> Result<FileId, EngineError> {
        let request = self.request(Method::POST, "/files")?.json(&json!({
            "projectId": project_id,
            "parentId": parent_id,
            "name": name,
            "kind": "file",
            "content": content,
        }));
        let response = self.send(request).await?;
        let created: CreatedId = self.decode(response).await?;
        Ok(created.id)
    }

    async fn create_folder(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<FileId, EngineError> {
        let request = self.request(Method::POST, "/files")?.json(&json!({
            "projectId": project_id,
            "parentId": parent_id,
            "name": name,
            "kind": "folder",
        }));
        let response = self.send(request).await?;
        let created: CreatedId = self.decode(response).await?;
        Ok(created.id)
    }

    async fn rename_entry(&self, file_id: &str, new_name: &str) -> Result<(), EngineError> {
        let request = self
            .request(Method::PATCH, &format!("/files/{file_id}"))?
            .json(&json!({ "name": new_name }));
        self.send(request).await?;
        Ok(())
    }

    async fn delete_entry(&self, file_id: &str) -> Result<(), EngineError> {
        let request = self.request(Method::DELETE, &format!("/files/{file_id}"))?;
        self.send(request).await?;
        Ok(())
    }

    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), EngineError> {
        let request = self
            .request(Method::PATCH, &format!("/files/{file_id}"))?
            .json(&json!({ "content": content }));
        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_fails_closed() {
        let store = HttpProjectStore::new("http://localhost:9", None);
        let err = store.conversation("c1").await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transient() {
        let store = HttpProjectStore::new("http://127.0.0.1:1", Some("key".to_string()));
        let err = store.conversation("c1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_base_url_normalization() {
        let store = HttpProjectStore::new("http://store.local/", Some("key".to_string()));
        assert_eq!(store.base_url, "http://store.local");
    }
}
