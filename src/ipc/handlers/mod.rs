pub mod accounts;
pub mod backup_exchange;
pub mod core;
pub mod master;
pub mod ranking;
pub mod records;
pub mod settings;
pub mod submissions;
