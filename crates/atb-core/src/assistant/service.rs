//! Assistant library: the personal assistant, user-created assistants, guest
//! links and remote cleanup.

use std::sync::Arc;

use crate::{
    assistant::{
        api::AssistantsApi,
        tools::ToolRegistry,
        types::{AssistantTool, NewAssistant, RemoteAssistant},
    },
    config::Config,
    domain::UserId,
    errors::Error,
    store::{Assistant, Page, Store, User, PERSONAL_ASSISTANT_NAME},
    Result,
};

const TEMPERATURE: f32 = 0.7;

/// Telegram rejects inline answers with more results than this.
pub const MAX_SHARE_CANDIDATES: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestOutcome {
    Deleted,
    AlreadyInLibrary(Assistant),
    Added(Assistant),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The caller was a guest; only their link is gone.
    LeftLibrary(Assistant),
    Deleted(Assistant),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantDetails {
    pub assistant: Assistant,
    pub is_guest: bool,
    pub is_personal: bool,
    pub guest_count: u64,
}

impl AssistantDetails {
    /// Rename, code interpreter and share are owner-only and not offered for
    /// the personal assistant.
    pub fn can_manage(&self) -> bool {
        !self.is_guest && !self.is_personal
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeInterpreterToggle {
    pub name: String,
    pub enabled: bool,
}

pub struct AssistantService {
    store: Arc<Store>,
    api: Arc<dyn AssistantsApi>,
    tools: Arc<ToolRegistry>,
    model: String,
    starter_tokens: i64,
}

impl AssistantService {
    pub fn new(
        cfg: &Config,
        store: Arc<Store>,
        api: Arc<dyn AssistantsApi>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            store,
            api,
            tools,
            model: cfg.assistant_model.clone(),
            starter_tokens: cfg.starter_tokens,
        }
    }

    /// Register the user on first contact and make sure they own a personal
    /// assistant.
    pub async fn ensure_user_and_personal_assistant(
        &self,
        user_id: UserId,
        first_name: &str,
    ) -> Result<User> {
        let (user, created) = self
            .store
            .ensure_user(user_id, first_name, self.starter_tokens)?;
        if created {
            tracing::info!(user_id = user_id.0, "new user registered");
        }

        if self.store.find_personal_assistant(user_id)?.is_none() {
            let remote = self
                .api
                .create_assistant(&NewAssistant {
                    model: self.model.clone(),
                    name: format!("{first_name}'s personal assistant"),
                    instructions: format!(
                        "You are a personal AI assistant to {first_name}. Answer the user's \
                         questions in the user's language. Address the user using their first name."
                    ),
                    temperature: TEMPERATURE,
                    tools: self.tools.definitions(),
                })
                .await?;
            self.store
                .create_assistant(user_id, PERSONAL_ASSISTANT_NAME, None, &remote.id)?;
            tracing::info!(user_id = user_id.0, remote_id = %remote.id, "personal assistant created");
        }
        Ok(user)
    }

    pub async fn create_assistant(
        &self,
        owner: UserId,
        name: &str,
        instructions: &str,
    ) -> Result<Assistant> {
        let (name, instructions) = (name.trim(), instructions.trim());
        if name.is_empty() {
            return Err(Error::InvalidInput("assistant name is empty".to_string()));
        }
        if instructions.is_empty() {
            return Err(Error::InvalidInput(
                "assistant instructions are empty".to_string(),
            ));
        }
        if name.eq_ignore_ascii_case(PERSONAL_ASSISTANT_NAME) {
            return Err(Error::InvalidInput(format!("{name} is a reserved name")));
        }

        let remote = self
            .api
            .create_assistant(&NewAssistant {
                model: self.model.clone(),
                name: name.to_string(),
                instructions: instructions.to_string(),
                temperature: TEMPERATURE,
                tools: self.tools.definitions(),
            })
            .await?;
        let assistant = self
            .store
            .create_assistant(owner, name, Some(instructions), &remote.id)?;
        tracing::info!(user_id = owner.0, assistant_id = %assistant.id, "assistant created");
        Ok(assistant)
    }

    pub fn list(&self, user: UserId, page: u32) -> Result<Page<Assistant>> {
        let items = self.store.list_assistants_for(user, page)?;
        let count = self.store.count_assistants_for(user)?;
        Ok(Page::new(items, page, count))
    }

    /// The assistant, if the user owns it or has it as a guest.
    pub fn accessible(&self, user: UserId, assistant_id: &str) -> Result<Assistant> {
        let assistant = self.find(assistant_id)?;
        if assistant.owner_id != user && !self.store.is_guest(user, assistant_id)? {
            return Err(Error::Forbidden(format!("assistant {assistant_id}")));
        }
        Ok(assistant)
    }

    pub fn details(&self, user: UserId, assistant_id: &str) -> Result<AssistantDetails> {
        let assistant = self.accessible(user, assistant_id)?;
        let is_guest = assistant.owner_id != user;
        Ok(AssistantDetails {
            is_personal: assistant.is_personal(),
            guest_count: self.store.guest_count(&assistant.id)?,
            is_guest,
            assistant,
        })
    }

    pub async fn delete_assistant(&self, user: UserId, assistant_id: &str) -> Result<DeleteOutcome> {
        let assistant = self.find(assistant_id)?;

        if assistant.owner_id != user {
            if self.store.remove_guest(assistant_id, user)? {
                return Ok(DeleteOutcome::LeftLibrary(assistant));
            }
            return Err(Error::Forbidden(format!("assistant {assistant_id}")));
        }
        if assistant.is_personal() {
            return Err(Error::Forbidden(
                "the personal assistant cannot be deleted".to_string(),
            ));
        }

        let deleted = self
            .store
            .delete_assistant(assistant_id)?
            .ok_or_else(|| Error::NotFound(format!("assistant {assistant_id}")))?;
        self.cleanup_remote(&deleted.serverside_id).await;
        Ok(DeleteOutcome::Deleted(deleted))
    }

    /// Best effort: every failure is logged and the next step still runs.
    async fn cleanup_remote(&self, remote_id: &str) {
        match self.api.retrieve_assistant(remote_id).await {
            Ok(remote) => self.cleanup_resources(&remote).await,
            Err(e) => {
                tracing::warn!(%remote_id, error = %e, "remote assistant not retrievable, skipping its files");
            }
        }
        if let Err(e) = self.api.delete_assistant(remote_id).await {
            tracing::warn!(%remote_id, error = %e, "deleting remote assistant failed");
        }
    }

    async fn cleanup_resources(&self, remote: &RemoteAssistant) {
        let store_ids = remote.vector_store_ids();
        let mut file_ids: Vec<String> = remote.code_interpreter_file_ids().to_vec();
        for store_id in store_ids {
            match self.api.list_vector_store_files(store_id).await {
                Ok(files) => file_ids.extend(files.into_iter().map(|f| f.id)),
                Err(e) => tracing::warn!(%store_id, error = %e, "listing vector store files failed"),
            }
        }

        for file_id in &file_ids {
            if let Err(e) = self.api.delete_file(file_id).await {
                tracing::warn!(%file_id, error = %e, "deleting file failed");
            }
        }
        for store_id in store_ids {
            if let Err(e) = self.api.delete_vector_store(store_id).await {
                tracing::warn!(%store_id, error = %e, "deleting vector store failed");
            }
        }
    }

    pub async fn toggle_code_interpreter(
        &self,
        user: UserId,
        assistant_id: &str,
    ) -> Result<CodeInterpreterToggle> {
        let assistant = self.find(assistant_id)?;
        if assistant.owner_id != user || assistant.is_personal() {
            return Err(Error::Forbidden(format!("assistant {assistant_id}")));
        }

        let remote = self.api.retrieve_assistant(&assistant.serverside_id).await?;
        let was_on = remote.tools.iter().any(AssistantTool::is_code_interpreter);
        let mut tools: Vec<AssistantTool> = remote
            .tools
            .into_iter()
            .filter(|t| !t.is_code_interpreter())
            .collect();
        if !was_on {
            tools.push(AssistantTool::CodeInterpreter);
        }
        self.api
            .update_assistant_tools(&assistant.serverside_id, &tools)
            .await?;

        Ok(CodeInterpreterToggle {
            name: remote.name.unwrap_or(assistant.name),
            enabled: !was_on,
        })
    }

    pub fn add_guest(&self, user: UserId, assistant_id: &str) -> Result<GuestOutcome> {
        let Some(assistant) = self.store.get_assistant(assistant_id)? else {
            return Ok(GuestOutcome::Deleted);
        };
        if assistant.owner_id == user || !self.store.add_guest(assistant_id, user)? {
            return Ok(GuestOutcome::AlreadyInLibrary(assistant));
        }
        Ok(GuestOutcome::Added(assistant))
    }

    /// Owned assistants that can be shared, filtered by name.
    pub fn share_candidates(&self, owner: UserId, query: &str) -> Result<Vec<Assistant>> {
        Ok(self
            .store
            .search_owned(owner, query)?
            .into_iter()
            .filter(|a| !a.is_personal())
            .take(MAX_SHARE_CANDIDATES)
            .collect())
    }

    fn find(&self, assistant_id: &str) -> Result<Assistant> {
        self.store
            .get_assistant(assistant_id)?
            .ok_or_else(|| Error::NotFound(format!("assistant {assistant_id}")))
    }
}
