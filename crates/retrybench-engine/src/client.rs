use async_trait::async_trait;
use retrybench_core::{Message, ModelError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization: Option<String>,
}

/// A chat-completion provider. Implementations classify their failures as
/// transient or fatal; transient ones should already be retried internally.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Sends the whole conversation and returns the reply text.
    async fn send(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
    ) -> Result<String, ModelError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError>;

    async fn is_available(&self) -> bool {
        self.list_models().await.is_ok()
    }
}
