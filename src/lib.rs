pub mod compare;
pub mod config;
pub mod drafts;
pub mod history;
pub mod message;
pub mod provider;
pub mod recipients;
pub mod sender;
pub mod storage;
pub mod types;
