pub mod convo;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod inject;
pub mod monitor;
pub mod retry;
pub mod target;
pub mod vote;

pub use convo::{
    ConversationController, ConvoConfig, ConvoEvents, ConvoHandle, ConvoSide, ConvoState,
    ConvoSummary, StopReason, TranscriptEntry,
};
pub use dispatch::{
    ComparePrompts, DispatchResult, Dispatcher, SessionSnapshot, TallyOutcome, VoteTally,
};
pub use document::{ChromiumDocument, ChromiumHost, Clipboard, Document, FileStore, HostConfig};
pub use error::CoreError;
pub use monitor::{CompletionSignal, MonitorOutcome};
pub use retry::RetryPolicy;
pub use target::{EditorFamily, Target, TargetSet};
pub use vote::{Vote, VoteStrategy};

#[cfg(test)]
pub(crate) mod testutil;
