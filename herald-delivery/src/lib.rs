//! Delivery side of herald.
//!
//! - [`ProviderRegistry`] builds the configured [`Provider`]
//! - [`DeadLetterRegistry`] builds the configured [`DeadLetterSink`]
//! - [`AddressResolver`] maps a queued recipient to an address
//! - [`Dispatcher`] polls the queue and delivers
//! - [`ReplayService`] lists, resends and deletes for operators
//!
//! Registries are plain values built once at start-up and passed to whoever
//! needs them; nothing here is global.

pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod policy;
pub mod provider;
pub mod replay;
pub mod resolver;
pub mod settings;

pub use dead_letter::{
    DeadLetterConfig, DeadLetterReason, DeadLetterRecord, DeadLetterRegistry, DeadLetterSink,
    DirectoryDeadLetters, LogDeadLetters, MboxDeadLetters, MemoryDeadLetters,
};
pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig, Outcome};
pub use error::{
    ConfigurationError, DeadLetterError, DeliveryError, LookupError, PermanentError, ReplayError,
    ResolveError, TemporaryError,
};
pub use headers::MessageHeaders;
pub use policy::RetryPolicy;
pub use provider::{
    JmapProvider, LogProvider, Provider, ProviderConfig, ProviderRegistry, SendmailProvider,
    SmtpProvider,
};
pub use replay::{
    DeletedFrom, FailedFilter, FailedItem, FailedStatus, ItemSource, Page, PageRequest,
    ReplayService, ResendOptions, ResendOutcome, Resent, SentFilter, SentItem,
};
pub use resolver::{
    AddressResolver, ResolvedRecipient, StaticUserDirectory, UserDirectory, UserRecord,
};
pub use settings::Settings;
