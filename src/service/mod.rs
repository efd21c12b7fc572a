//! 外部协作方接口与补发服务 / External collaborator seams and catch-up

pub mod catchup;
pub mod collab;

pub use catchup::{read_key, CatchUpService};
pub use collab::{
    CacheGroupDirectory, CacheTokenResolver, GroupDirectory, IdentityResolver,
    StaticGroupDirectory, StaticIdentityResolver,
};
