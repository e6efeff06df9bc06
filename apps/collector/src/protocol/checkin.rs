use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::directory::resilient::ResilientDirectory;
use crate::directory::types::StatusKey;
use crate::protocol::{AgentProtocol, AgentReply, AgentRequest, ProtocolError};
use crate::sessions::{NewSession, Session, SessionManager};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum CheckinCommand {
    Auth {
        build_id: String,
        instance_id: String,
        subtype: String,
        proof: String,
    },
    Id,
    Config,
    Upload,
    Download,
    Filesystem,
    Bye,
}

/// JSON check-in protocol spoken by agents.
///
/// `auth` proves knowledge of the build's class key and opens a session;
/// every other command requires the session cookie and answers from the
/// resilient directory, so it keeps working while the backend is down.
pub struct CheckinProtocol {
    directory: Arc<ResilientDirectory>,
    sessions: Arc<SessionManager>,
}

impl CheckinProtocol {
    pub fn new(directory: Arc<ResilientDirectory>, sessions: Arc<SessionManager>) -> Self {
        Self {
            directory,
            sessions,
        }
    }

    async fn authenticate(
        &self,
        build_id: String,
        instance_id: String,
        subtype: String,
        proof: String,
    ) -> Result<AgentReply, ProtocolError> {
        let class_key = self
            .directory
            .class_key_of(&build_id)
            .await
            .ok_or_else(|| ProtocolError::UnknownBuild(build_id.clone()))?;

        if !proof.eq_ignore_ascii_case(&auth_proof(&class_key, &instance_id)) {
            tracing::warn!(build_id = %build_id, instance_id = %instance_id, "agent proof rejected");
            return Err(ProtocolError::AuthenticationFailed(
                "proof does not match class key".to_string(),
            ));
        }

        let key = StatusKey::new(build_id, instance_id, subtype);
        let status = self.directory.status_of(&key).await;
        if !status.state.admits_sessions() {
            return Err(ProtocolError::AuthenticationFailed(format!(
                "agent is {}",
                status.state.as_str()
            )));
        }

        let token = self
            .sessions
            .create(NewSession {
                agent_record_id: status.agent_id,
                build_id: key.build_id,
                instance_id: key.instance_id,
                subtype: key.subtype,
                class_key,
            })
            .await;
        let signature = self.directory.signature().await.map(hex::encode);

        Ok(AgentReply::json(&json!({
            "status": "ok",
            "state": status.state.as_str(),
            "agent_id": status.agent_id,
            "signature": signature,
        }))
        .with_session_token(token))
    }

    async fn session(&self, request: &AgentRequest) -> Result<Session, ProtocolError> {
        let token = request
            .session_token
            .as_deref()
            .ok_or(ProtocolError::SessionNotFound)?;
        self.sessions
            .get(token)
            .await
            .ok_or(ProtocolError::SessionNotFound)
    }

    async fn identify(&self, session: Session) -> Value {
        let status = self
            .directory
            .status_of(&StatusKey::new(
                session.build_id.clone(),
                session.instance_id.clone(),
                session.subtype.clone(),
            ))
            .await;
        json!({
            "status": "ok",
            "agent_id": session.agent_record_id,
            "build_id": session.build_id,
            "instance_id": session.instance_id,
            "state": status.state.as_str(),
        })
    }

    async fn pending_config(&self, agent_id: u64) -> Value {
        let config = self.directory.new_config(agent_id).await.map(|config| {
            json!({
                "config_id": config.config_id,
                "content": BASE64.encode(config.content),
            })
        });
        json!({ "status": "ok", "config": config })
    }

    async fn next_upload(&self, agent_id: u64) -> Value {
        match self.directory.new_upload(agent_id).await {
            Some((upload, remaining)) => json!({
                "status": "ok",
                "upload": {
                    "filename": upload.filename,
                    "content": BASE64.encode(upload.content),
                },
                "remaining": remaining,
            }),
            None => json!({ "status": "ok", "upload": null, "remaining": 0 }),
        }
    }

    async fn download_patterns(&self, agent_id: u64) -> Value {
        let patterns: Vec<String> = self
            .directory
            .new_downloads(agent_id)
            .await
            .into_iter()
            .map(|download| download.pattern)
            .collect();
        json!({ "status": "ok", "patterns": patterns })
    }

    async fn filesystem_rules(&self, agent_id: u64) -> Value {
        let rules: Vec<Value> = self
            .directory
            .new_filesystem_rules(agent_id)
            .await
            .into_iter()
            .map(|rule| json!({ "path": rule.path, "depth": rule.depth }))
            .collect();
        json!({ "status": "ok", "rules": rules })
    }
}

/// Hex SHA-256 over the class key followed by the instance id.
pub fn auth_proof(class_key: &[u8], instance_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class_key);
    hasher.update(instance_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl AgentProtocol for CheckinProtocol {
    async fn handle(&self, request: AgentRequest) -> Result<AgentReply, ProtocolError> {
        if request.body.is_empty() {
            return Err(ProtocolError::MalformedRequest("empty body".to_string()));
        }
        let command: CheckinCommand = serde_json::from_slice(&request.body)
            .map_err(|error| ProtocolError::MalformedRequest(error.to_string()))?;

        // Every command except `auth` needs a live session.
        let answer = match command {
            CheckinCommand::Auth {
                build_id,
                instance_id,
                subtype,
                proof,
            } => {
                return self
                    .authenticate(build_id, instance_id, subtype, proof)
                    .await;
            }
            CheckinCommand::Id => self.identify(self.session(&request).await?).await,
            CheckinCommand::Config => {
                let session = self.session(&request).await?;
                self.pending_config(session.agent_record_id).await
            }
            CheckinCommand::Upload => {
                let session = self.session(&request).await?;
                self.next_upload(session.agent_record_id).await
            }
            CheckinCommand::Download => {
                let session = self.session(&request).await?;
                self.download_patterns(session.agent_record_id).await
            }
            CheckinCommand::Filesystem => {
                let session = self.session(&request).await?;
                self.filesystem_rules(session.agent_record_id).await
            }
            CheckinCommand::Bye => {
                let session = self.session(&request).await?;
                self.sessions.delete(&session.token).await;
                json!({ "status": "ok" })
            }
        };
        Ok(AgentReply::json(&answer))
    }
}
