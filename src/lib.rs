pub mod connection;
pub mod crypto;
pub mod logging;
pub mod mailbox;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod relay_transport;
pub mod storage;
