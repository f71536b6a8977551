pub mod map;
pub mod set;

pub use map::CidrMap;
pub use set::CidrSet;
pub use cidr::{AnyIpCidr, IpCidr};
