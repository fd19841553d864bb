//! Message-processing pipeline: turns a client send request into a
//! persisted, type-dispatched, optionally-translated message and fans the
//! result out through the hub. Also owns the correlation of external
//! translation/training task ids back to in-flight work.

pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod tasks;
pub mod translation;

pub use dispatch::{MessageContext, MessageDispatcher, SendMessageRequest};
pub use error::PipelineError;
pub use handlers::MessageHandler;
pub use tasks::{PendingTask, PendingTasks};
pub use translation::{TranslationCoordinator, WebhookOutcome};
