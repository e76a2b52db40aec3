pub mod chat_log;
pub mod lead;
pub mod session;
pub mod topic;
