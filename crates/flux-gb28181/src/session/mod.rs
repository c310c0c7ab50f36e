// 拉流会话层

pub mod manager;
pub mod options;
pub mod pull;

pub use manager::{default_stream_path, parse_stream_path, InviteOutcome, SessionManager};
pub use options::InviteOptions;
pub use pull::{PullStream, PullStreamInfo, PullStreamRegistry};
