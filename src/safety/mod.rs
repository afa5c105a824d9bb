pub mod lock_manager;
pub mod safe_cleanup;
pub mod store;
