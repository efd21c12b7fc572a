//! 协作方接口 / Collaborator interfaces
//!
//! 身份解析与群目录都是外部系统，这里只消费窄接口。缓存实现读取认证
//! 服务与群服务预写入共享缓存的数据；静态实现供测试与演示使用。
//! Identity resolution and the group directory are external systems
//! consumed through narrow interfaces. The cache-backed implementations
//! read data pre-written to the shared cache by the auth and group
//! services; the static ones back tests and demos.

use crate::cache::SharedCache;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// 凭据 → 已验证用户ID / Credential to verified user id
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<String>;
}

/// 群成员分页查询与用户群列表 / Paged group membership and per-user groups
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// 第 `page` 页成员，每页至多 `page_size` 个；返回不足一页表示结束。
    /// Members of page `page`, at most `page_size` each; a short page ends
    /// the iteration.
    async fn members_of(&self, group_id: &str, page_size: usize, page: usize)
        -> Result<Vec<String>>;

    async fn groups_of(&self, user_id: &str) -> Result<Vec<String>>;
}

/// 从共享缓存读取令牌映射 / Token mapping read from the shared cache
/// (`token:{credential}` → uid, written by the auth service)
pub struct CacheTokenResolver {
    cache: Arc<dyn SharedCache>,
}

impl CacheTokenResolver {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl IdentityResolver for CacheTokenResolver {
    async fn resolve(&self, credential: &str) -> Result<String> {
        self.cache
            .get(&format!("token:{}", credential))
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown or expired credential"))
    }
}

/// 从共享缓存读取群关系 / Group relations read from the shared cache
/// (`im:groups:{uid}`, `im:group:members:{gid}` lists maintained by the
/// group service)
pub struct CacheGroupDirectory {
    cache: Arc<dyn SharedCache>,
}

impl CacheGroupDirectory {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl GroupDirectory for CacheGroupDirectory {
    async fn members_of(
        &self,
        group_id: &str,
        page_size: usize,
        page: usize,
    ) -> Result<Vec<String>> {
        let start = (page * page_size) as isize;
        let stop = start + page_size as isize - 1;
        self.cache
            .list_range(&format!("im:group:members:{}", group_id), start, stop)
            .await
    }

    async fn groups_of(&self, user_id: &str) -> Result<Vec<String>> {
        self.cache
            .list_range(&format!("im:groups:{}", user_id), 0, -1)
            .await
    }
}

/// 静态令牌表 / Static token table
#[derive(Default)]
pub struct StaticIdentityResolver {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: &str, user_id: &str) {
        self.tokens
            .write()
            .insert(credential.to_string(), user_id.to_string());
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<String> {
        self.tokens
            .read()
            .get(credential)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown credential"))
    }
}

/// 静态群表 / Static group table
#[derive(Default)]
pub struct StaticGroupDirectory {
    members: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, group_id: &str, user_id: &str) {
        let mut members = self.members.write();
        let group = members.entry(group_id.to_string()).or_default();
        if !group.iter().any(|m| m == user_id) {
            group.push(user_id.to_string());
        }
    }
}

#[async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn members_of(
        &self,
        group_id: &str,
        page_size: usize,
        page: usize,
    ) -> Result<Vec<String>> {
        let members = self.members.read();
        let Some(group) = members.get(group_id) else {
            return Ok(Vec::new());
        };
        Ok(group
            .iter()
            .skip(page * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn groups_of(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .members
            .read()
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == user_id))
            .map(|(group_id, _)| group_id.clone())
            .collect())
    }
}
