// IPC module - Communication between client and daemon

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{
    Command, ErrorReply, LogRequest, LogSection, LogStream, NameOutcome, ReloadReport, Request,
    Response, ResponseData, Target,
};
pub use server::{IpcServer, DEFAULT_SOCKET_PATH};
