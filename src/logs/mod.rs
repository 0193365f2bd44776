// Logs module - Per-instance log routing and tailing

mod format;
mod reader;
mod router;

pub use format::TimestampFormat;
pub use reader::tail_lines;
pub use router::{LogRouter, LogRouterStats, LogWarning, StreamKind, MAX_PENDING_LINES};
