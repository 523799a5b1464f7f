pub mod announce;
pub mod member_registry;
pub mod membership_events;
