mod branch;
mod merge;
mod message;
mod tree;

pub use branch::{
    Branch, BranchNavigator, Direction, NavigationOutcome, SiblingPosition, TreeUpdate,
};
pub use merge::{Draft, MergeEngine, PendingMessage, PendingState, StoreEffect};
pub use message::{
    Annotation, Attachment, Attribution, Message, MessageContent, MessagePart, ReasoningDetail,
    Role, Source, SourceType, ToolInvocation, ToolInvocationState,
};
pub use tree::{MessageNode, MessageTree, TreeIssue};
