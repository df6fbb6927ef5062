pub mod assignments;
pub mod backup_exchange;
pub mod core;
pub mod patterns;
pub mod recommend;
pub mod setup;
pub mod slots;
pub mod students;
pub mod teachers;
