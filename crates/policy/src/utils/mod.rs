pub mod events;
pub mod policy_store;
