//! Outbound request safety: CIDR matching, address classification and URL validation.

pub mod cidr;
pub mod classifier;
pub mod policy;
pub mod resolver;
pub mod validator;

pub use cidr::{ip_in_range, is_in_range, CidrRange};
pub use classifier::{classify_address, is_address_safe, is_hostname_blocked, BlockReason};
pub use policy::{AddressSafetyPolicy, DEFAULT_BLOCKED_RANGES};
pub use resolver::{HostResolver, StaticResolver, SystemResolver};
pub use validator::{UrlRejection, UrlSafetyValidator};
