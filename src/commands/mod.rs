pub mod daemon;
pub mod delete;
pub mod end;
pub mod expire;
pub mod hook;
pub mod list;
pub mod show;
