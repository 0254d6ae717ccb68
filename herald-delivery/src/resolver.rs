//! Turning a queued message's recipient into a deliverable address.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use herald_queue::{QueuedMessage, Recipient, RecipientClass, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    error::{LookupError, ResolveError},
    headers::{MessageHeaders, is_usable_address},
};

/// An account as known to the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Preferred language id.
    #[serde(default)]
    pub language: Option<u32>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserRecord {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// The stored email when it looks deliverable.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| is_usable_address(email))
    }
}

/// Account lookup used by the resolver and by replay filters.
#[async_trait]
pub trait UserDirectory: Send + Sync + std::fmt::Debug {
    async fn get_user(&self, id: UserId) -> Result<UserRecord, LookupError>;
}

/// A fixed set of users, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    users: HashMap<UserId, UserRecord>,
}

impl StaticUserDirectory {
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            users: users.into_iter().map(|user| (user.id, user)).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn get_user(&self, id: UserId) -> Result<UserRecord, LookupError> {
        self.users.get(&id).cloned().ok_or(LookupError::NotFound(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub address: String,
    pub class: RecipientClass,
}

#[derive(Debug, Clone)]
pub struct AddressResolver {
    directory: Arc<dyn UserDirectory>,
}

impl AddressResolver {
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Final address for `message`.
    ///
    /// Direct recipients are returned verbatim without a lookup. User
    /// recipients use the account's current email. Userless messages fall
    /// back to the `To` header of the stored body.
    ///
    /// # Errors
    /// [`ResolveError::Unresolved`] when no address exists now or ever will,
    /// [`ResolveError::Directory`] when the directory itself failed.
    pub async fn resolve(&self, message: &QueuedMessage) -> Result<ResolvedRecipient, ResolveError> {
        let class = message.class();
        let address = match &message.recipient {
            Recipient::Direct(address) => address.clone(),
            Recipient::ByUser(id) if id.is_none() => MessageHeaders::parse(&message.body)
                .to
                .ok_or_else(|| {
                    ResolveError::Unresolved(format!("Message {} has no user and no To header", message.id))
                })?,
            Recipient::ByUser(id) => {
                let user = self.user(*id).await?;
                user.address().map(ToString::to_string).ok_or_else(|| {
                    ResolveError::Unresolved(format!("User {id} has no usable email address"))
                })?
            }
        };

        Ok(ResolvedRecipient { address, class })
    }

    /// Look up an account, mapping absence to [`ResolveError::Unresolved`].
    ///
    /// # Errors
    /// See [`AddressResolver::resolve`].
    pub async fn user(&self, id: UserId) -> Result<UserRecord, ResolveError> {
        self.directory.get_user(id).await.map_err(|e| match e {
            LookupError::NotFound(id) => ResolveError::Unresolved(format!("User {id} not found")),
            LookupError::Unavailable(reason) => ResolveError::Directory(reason),
        })
    }
}
