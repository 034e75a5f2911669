pub mod attempts;
pub mod backup_exchange;
pub mod core;
pub mod mail;
pub mod profiles;
pub mod results;
