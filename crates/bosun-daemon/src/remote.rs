use uuid::Uuid;

use crate::instance::configuration::ServerConfigurationResponse;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The control plane no longer knows this instance; the caller should
    /// remove it locally.
    #[error("server does not exist on the control plane")]
    ServerDoesNotExist,

    #[error("control plane request failed with status {status}")]
    RequestError { status: u16 },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// HTTPS client for the control plane. All requests carry the node's bearer
/// token; error statuses are preserved so callers can react to a 404.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, serde::Deserialize)]
struct ListServersResponse {
    data: Vec<ServerConfigurationResponse>,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("static client configuration is valid"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// True when a control plane has been configured at all. An unconfigured
    /// daemon manages whatever it already knows about.
    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/remote/{path}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 404 {
            return Err(RemoteError::ServerDoesNotExist);
        }
        Err(RemoteError::RequestError {
            status: status.as_u16(),
        })
    }

    /// Fetches the authoritative list of instances assigned to this node.
    pub async fn list_servers(&self) -> Result<Vec<ServerConfigurationResponse>, RemoteError> {
        let response = self
            .http
            .get(self.url("servers"))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let body: ListServersResponse = self.check(response).await?.json().await?;
        Ok(body.data)
    }

    pub async fn get_server_configuration(
        &self,
        uuid: Uuid,
    ) -> Result<ServerConfigurationResponse, RemoteError> {
        let response = self
            .http
            .get(self.url(&format!("servers/{uuid}")))
            .bearer_auth(&self.token)
            .send()
            .await?;

        Ok(self.check(response).await?.json().await?)
    }

    /// Reports the outcome of an installation run.
    pub async fn set_install_status(
        &self,
        uuid: Uuid,
        successful: bool,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(self.url(&format!("servers/{uuid}/install")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "successful": successful }))
            .send()
            .await?;

        self.check(response).await.map(|_| ())
    }

    pub async fn send_backup_status(
        &self,
        uuid: Uuid,
        backup: Uuid,
        data: serde_json::Value,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(self.url(&format!("servers/{uuid}/backups/{backup}")))
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await?;

        self.check(response).await.map(|_| ())
    }
}
