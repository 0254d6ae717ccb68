//! Operator-facing inspection and repair of the queue and dead letters.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use herald_common::{audit, internal};
use herald_queue::{
    MessageId, QueueError, QueueFilter, QueueStore, QueuedMessage, Recipient, RecipientClass,
    TimeWindow, UserId,
};
use serde::Serialize;

use crate::{
    dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink},
    error::{ReplayError, ResolveError},
    headers::MessageHeaders,
    resolver::{AddressResolver, UserRecord},
};

const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    fn validate(self) -> Result<Self, ReplayError> {
        if self.limit == 0 {
            return Err(ReplayError::InvalidPage("limit must be at least 1".into()));
        }
        Ok(self)
    }

    fn slice<T>(self, mut items: Vec<T>) -> (Vec<T>, usize) {
        let total = items.len();
        let start = self.offset.min(total);
        let end = start.saturating_add(self.limit).min(total);
        (items.drain(start..end).collect(), total)
    }
}

/// One page of results plus the size of the whole result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Which failed messages to include.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailedStatus {
    #[default]
    Any,
    /// Still in the queue with at least one failure.
    Retrying,
    DeadLettered,
}

impl FromStr for FailedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "all" => Ok(Self::Any),
            "failed" | "retrying" => Ok(Self::Retrying),
            "dead-lettered" | "dead_lettered" | "dlq" => Ok(Self::DeadLettered),
            other => Err(format!("Unknown status '{other}', expected any, failed or dead-lettered")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedFilter {
    /// Only user recipients whose account has this language.
    pub language: Option<u32>,
    /// Only user recipients whose account has this role.
    pub role: Option<String>,
    pub class: Option<RecipientClass>,
    pub status: FailedStatus,
    /// Applied to the creation time.
    pub window: TimeWindow,
}

impl FailedFilter {
    const fn needs_user(&self) -> bool {
        self.language.is_some() || self.role.is_some()
    }

    fn matches_user(&self, user: &UserRecord) -> bool {
        self.language.is_none_or(|language| user.language == Some(language))
            && self.role.as_deref().is_none_or(|role| user.has_role(role))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentFilter {
    /// A numeric user id, or an address compared case-insensitively.
    pub recipient: Option<String>,
    pub class: Option<RecipientClass>,
    /// Applied to the send time.
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemSource {
    Queue,
    DeadLetter,
}

impl ItemSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where [`ReplayService::delete`] found the message.
pub type DeletedFrom = ItemSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub id: MessageId,
    pub source: ItemSource,
    pub class: RecipientClass,
    /// Human readable recipient, e.g. `x@example.com (direct)`.
    pub recipient: String,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub reason: Option<DeadLetterReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentItem {
    pub id: MessageId,
    pub class: RecipientClass,
    pub recipient: String,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendOptions {
    /// Leave the failed original where it is.
    pub keep_original: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resent {
    pub original: MessageId,
    pub new: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResendOutcome {
    pub resent: Vec<Resent>,
    pub count: usize,
}

enum Original {
    Live(QueuedMessage),
    Dead(DeadLetterRecord),
}

impl Original {
    const fn message(&self) -> &QueuedMessage {
        match self {
            Self::Live(message) => message,
            Self::Dead(record) => &record.message,
        }
    }

    const fn source(&self) -> ItemSource {
        match self {
            Self::Live(_) => ItemSource::Queue,
            Self::Dead(_) => ItemSource::DeadLetter,
        }
    }
}

/// Users looked up during one call.
#[derive(Default)]
struct UserCache {
    users: HashMap<UserId, Option<UserRecord>>,
}

/// Inspection and repair operations. Every error reaches the caller.
#[derive(Debug, Clone)]
pub struct ReplayService {
    store: Arc<dyn QueueStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    resolver: AddressResolver,
}

impl ReplayService {
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        resolver: AddressResolver,
    ) -> Self {
        Self {
            store,
            dead_letters,
            resolver,
        }
    }

    /// `None` for a missing account, an error when the directory is down.
    async fn lookup(&self, cache: &mut UserCache, id: UserId) -> Result<Option<UserRecord>, ReplayError> {
        if let Some(user) = cache.users.get(&id) {
            return Ok(user.clone());
        }

        let user = match self.resolver.user(id).await {
            Ok(user) => Some(user),
            Err(ResolveError::Unresolved(_)) => None,
            Err(ResolveError::Directory(reason)) => return Err(ReplayError::Directory(reason)),
        };
        cache.users.insert(id, user.clone());
        Ok(user)
    }

    /// Display form of the recipient. Lookup failures fall back to the id.
    async fn display(&self, cache: &mut UserCache, message: &QueuedMessage, headers: &MessageHeaders) -> String {
        match &message.recipient {
            Recipient::Direct(address) => format!("{address} (direct)"),
            Recipient::ByUser(id) if id.is_none() => headers
                .to
                .as_deref()
                .map_or_else(|| String::from("(userless)"), |to| format!("{to} (userless)")),
            Recipient::ByUser(id) => match self.lookup(cache, *id).await {
                Ok(Some(user)) => user
                    .address()
                    .map_or_else(|| format!("user:{id}"), |address| format!("{address} (user:{id})")),
                Ok(None) | Err(_) => format!("user:{id}"),
            },
        }
    }

    /// Address a sent message went to, for recipient filtering.
    async fn delivered_address(
        &self,
        cache: &mut UserCache,
        message: &QueuedMessage,
    ) -> Result<Option<String>, ReplayError> {
        Ok(match &message.recipient {
            Recipient::Direct(address) => Some(address.clone()),
            Recipient::ByUser(id) if id.is_none() => MessageHeaders::parse(&message.body).to,
            Recipient::ByUser(id) => self
                .lookup(cache, *id)
                .await?
                .and_then(|user| user.address().map(ToString::to_string)),
        })
    }

    /// Failed messages, live and dead-lettered, newest first.
    ///
    /// # Errors
    /// Invalid page, storage failures, or a directory outage while applying
    /// the language or role filters.
    pub async fn list_failed(
        &self,
        filter: &FailedFilter,
        page: PageRequest,
    ) -> Result<Page<FailedItem>, ReplayError> {
        let page = page.validate()?;
        let mut cache = UserCache::default();

        let records = self.dead_letters.list().await?;
        let dead_ids: HashSet<MessageId> = records.iter().map(DeadLetterRecord::id).collect();

        let mut candidates: Vec<Original> = Vec::new();
        if filter.status != FailedStatus::DeadLettered {
            let live = self
                .store
                .list_failed(&QueueFilter {
                    class: filter.class,
                    window: filter.window,
                    ..QueueFilter::default()
                })
                .await?;
            candidates.extend(
                live.into_iter()
                    .filter(|message| !dead_ids.contains(&message.id))
                    .map(Original::Live),
            );
        }
        if filter.status != FailedStatus::Retrying {
            candidates.extend(
                records
                    .into_iter()
                    .filter(|record| {
                        filter.class.is_none_or(|class| record.message.class() == class)
                            && filter.window.contains(record.message.created_at)
                    })
                    .map(Original::Dead),
            );
        }

        if filter.needs_user() {
            let mut kept = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let Some(id) = candidate.message().recipient.user_id() else {
                    continue;
                };
                if let Some(user) = self.lookup(&mut cache, id).await?
                    && filter.matches_user(&user)
                {
                    kept.push(candidate);
                }
            }
            candidates = kept;
        }

        candidates.sort_by(|a, b| {
            let (a, b) = (a.message(), b.message());
            b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
        });
        let (candidates, total) = page.slice(candidates);

        let mut items = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let message = candidate.message();
            let headers = MessageHeaders::parse(&message.body);
            let recipient = self.display(&mut cache, message, &headers).await;
            let (dead_lettered_at, reason) = match &candidate {
                Original::Dead(record) => (Some(record.dead_lettered_at), Some(record.reason)),
                Original::Live(_) => (None, None),
            };

            items.push(FailedItem {
                id: message.id,
                source: candidate.source(),
                class: message.class(),
                recipient,
                subject: headers.subject,
                created_at: message.created_at,
                error_count: message.error_count,
                last_error: message.last_error.clone(),
                dead_lettered_at,
                reason,
            });
        }

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Delivered messages, most recently sent first.
    ///
    /// # Errors
    /// Invalid page, storage failures, or a directory outage while matching
    /// an address filter against user recipients.
    pub async fn list_sent(
        &self,
        filter: &SentFilter,
        page: PageRequest,
    ) -> Result<Page<SentItem>, ReplayError> {
        let page = page.validate()?;
        let mut cache = UserCache::default();

        let mut sent = self
            .store
            .list_sent(&QueueFilter {
                class: filter.class,
                window: filter.window,
                ..QueueFilter::default()
            })
            .await?;

        if let Some(recipient) = filter.recipient.as_deref().map(str::trim) {
            if let Ok(user) = recipient.parse::<UserId>() {
                sent.retain(|message| message.recipient.user_id() == Some(user));
            } else {
                let mut kept = Vec::with_capacity(sent.len());
                for message in sent {
                    if self
                        .delivered_address(&mut cache, &message)
                        .await?
                        .is_some_and(|address| address.eq_ignore_ascii_case(recipient))
                    {
                        kept.push(message);
                    }
                }
                sent = kept;
            }
        }

        sent.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
        let (sent, total) = page.slice(sent);

        let mut items = Vec::with_capacity(sent.len());
        for message in sent {
            let Some(sent_at) = message.sent_at else {
                continue;
            };
            let headers = MessageHeaders::parse(&message.body);
            let recipient = self.display(&mut cache, &message, &headers).await;
            items.push(SentItem {
                id: message.id,
                class: message.class(),
                recipient,
                subject: headers.subject,
                created_at: message.created_at,
                sent_at,
                error_count: message.error_count,
            });
        }

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn original(&self, id: MessageId) -> Result<Original, ReplayError> {
        match self.store.get(id).await {
            Ok(message) if message.is_sent() => Err(ReplayError::AlreadySent(id)),
            Ok(message) => Ok(Original::Live(message)),
            Err(e) if e.is_not_found() => match self.dead_letters.get(id).await {
                Ok(record) => Ok(Original::Dead(record)),
                Err(e) if e.is_not_found() => Err(ReplayError::NotFound(id)),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue a fresh copy of each message.
    ///
    /// Every id is checked before anything is written, so an unknown or
    /// already sent id leaves both stores untouched. Live originals are
    /// removed only when no delivery attempt holds them; otherwise the copy
    /// is withdrawn and [`ReplayError::InFlight`] returned.
    ///
    /// # Errors
    /// `NoIds`, `NotFound`, `AlreadySent`, `InFlight` or a storage failure.
    pub async fn resend(
        &self,
        ids: &[MessageId],
        options: ResendOptions,
    ) -> Result<ResendOutcome, ReplayError> {
        if ids.is_empty() {
            return Err(ReplayError::NoIds);
        }

        let mut seen = HashSet::new();
        let mut originals = Vec::with_capacity(ids.len());
        for &id in ids {
            if seen.insert(id) {
                originals.push(self.original(id).await?);
            }
        }

        let mut resent = Vec::with_capacity(originals.len());
        for original in originals {
            let message = original.message();
            let new = self
                .store
                .enqueue(message.recipient.clone(), message.body.clone())
                .await?;

            if !options.keep_original {
                self.remove_original(&original, new).await?;
            }

            audit::log_resent(message.id.get(), new.get(), original.source().as_str());
            resent.push(Resent {
                original: message.id,
                new,
            });
        }

        Ok(ResendOutcome {
            count: resent.len(),
            resent,
        })
    }

    async fn remove_original(&self, original: &Original, copy: MessageId) -> Result<(), ReplayError> {
        let id = original.message().id;
        match original {
            Original::Live(_) => match self.store.take(id).await {
                Ok(_) => Ok(()),
                Err(QueueError::Claimed(_)) => {
                    if let Err(e) = self.store.take(copy).await {
                        internal!(level = ERROR, %id, %copy, error = %e, "Unable to withdraw resent copy");
                    }
                    Err(ReplayError::InFlight(id))
                }
                // Delivered or escalated in the meantime; the copy stands.
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
            Original::Dead(_) => match self.dead_letters.remove(id).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Remove a message from the queue, or failing that from the dead letters.
    ///
    /// # Errors
    /// `NotFound` when neither holds it, or a storage failure.
    pub async fn delete(&self, id: MessageId) -> Result<DeletedFrom, ReplayError> {
        let source = match self.store.delete(id).await {
            Ok(_) => ItemSource::Queue,
            Err(e) if e.is_not_found() => match self.dead_letters.remove(id).await {
                Ok(_) => ItemSource::DeadLetter,
                Err(e) if e.is_not_found() => return Err(ReplayError::NotFound(id)),
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        audit::log_deleted(id.get(), source.as_str());
        Ok(source)
    }
}
