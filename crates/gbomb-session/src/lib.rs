//! Session authorization for the Gbomb SDK.
//!
//! This crate provides:
//! - [`Session`]: the authorization state machine holding the current token
//! - [`AuthStrategy`] and its variants: system account store, native app
//!   hand-off, embedded web dialog, system browser
//! - [`TokenCache`]: credential persistence (file-backed or in-memory)
//! - [`AppCallRegistry`]: correlation of "app resumed with URL" events
//! - [`AuthLogger`]: diagnostic events for each login attempt
//! - [`SessionRegistry`]: the active session
//! - [`utility`]: login URL, client state and permission helpers

pub mod app_call;
pub mod auth_logger;
pub mod error;
pub mod registry;
pub mod session;
pub mod strategy;
pub mod token_cache;
pub mod transitions;
pub mod types;
pub mod utility;

pub use app_call::{AppCallRegistry, AppCallResponse, PendingAppCall};
pub use auth_logger::{AuthEventKind, AuthLogEvent, AuthLogger};
pub use error::{AuthFailure, AuthSubcode, OAUTH_ERROR_CODE, Result, SessionError};
pub use registry::SessionRegistry;
pub use session::{Session, SessionBuilder, SessionDelegate};
pub use strategy::{
    AccountStore, AppSwitcher, AuthRequest, AuthStrategy, BrowserFallbackStrategy,
    LoginDialogPresenter, MockStrategy, NativeAppHandoffStrategy, StrategyKind,
    SystemAccountCredential, SystemAccountStoreStrategy, WebDialogStrategy,
};
pub use token_cache::{
    DEFAULT_TOKEN_KEY, FileTokenCache, InMemoryTokenCache, SharedTokenCache, TokenCache,
    create_memory_token_cache, create_token_cache,
};
pub use transitions::{SessionTransitions, SharedSession};
pub use types::{DefaultAudience, LoginBehavior, LoginType, SessionState, TokenGrant};
