//! In-memory indexed policy caches
//!
//! Each runtime service owns one [`PolicyCache`] and one [`RolePolicyCache`].
//! Both are [`IndexedCache`]s: principal → [`ResourceIndex`] → policy IDs,
//! plus a policy map and a compiled-condition map.

pub mod indexed;
pub mod policy_cache;
pub mod prefix_tree;
pub mod resource_index;
pub mod role_policy_cache;

pub use indexed::{Indexable, IndexedCache};
pub use policy_cache::PolicyCache;
pub use prefix_tree::{IdSet, PrefixTree};
pub use resource_index::{expression_matches, ResourceIndex, ResourcePattern};
pub use role_policy_cache::RolePolicyCache;
