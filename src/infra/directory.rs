use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::DirectoryConfig;
use crate::error::{HubError, Result};

/// 目录服务：用户所属群组、群成员、帖子 / 评论作者
///
/// 这是调度引擎得知“归属者”的唯一途径。
#[async_trait]
pub trait Directory: Send + Sync {
    /// 用户加入的群组 id（连接时计算订阅集合）
    async fn user_groups(&self, user_id: &str) -> Result<Vec<String>>;

    /// 群组成员 id
    async fn group_members(&self, group_id: &str) -> Result<Vec<String>>;

    /// 帖子作者 id
    async fn post_author(&self, post_id: &str) -> Result<String>;

    /// 评论作者 id
    async fn comment_author(&self, comment_id: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct GroupRef {
    id: String,
}

#[derive(Deserialize)]
struct GroupDoc {
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Deserialize)]
struct OwnedDoc {
    user_id: String,
}

/// 基于 REST API 的目录服务
pub struct HttpDirectory {
    client: Client,
    base_url: Url,
    service_token: Option<String>,
}

impl HttpDirectory {
    pub fn new(config: &DirectoryConfig, base_url: &str) -> Result<Self> {
        // 保证以 / 结尾，否则 join 会替换最后一段路径
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| HubError::Configuration(format!("directory.base_url: {}", e)))?;
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url,
            service_token: config.service_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| HubError::Directory(format!("bad path {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.service_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(HubError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("⚠️ 目录服务请求失败: url={}, status={}, error={}", url, status, error_text);
            return Err(HubError::Directory(format!(
                "GET {} failed: status={}",
                path, status
            )));
        }

        debug!("目录服务请求成功: {}", url);
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn user_groups(&self, user_id: &str) -> Result<Vec<String>> {
        let groups: Vec<GroupRef> = self.get_json(&format!("users/{}/groups", user_id)).await?;
        Ok(groups.into_iter().map(|g| g.id).collect())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let group: GroupDoc = self.get_json(&format!("groups/{}", group_id)).await?;
        Ok(group.members)
    }

    async fn post_author(&self, post_id: &str) -> Result<String> {
        let post: OwnedDoc = self.get_json(&format!("feed/posts/{}", post_id)).await?;
        Ok(post.user_id)
    }

    async fn comment_author(&self, comment_id: &str) -> Result<String> {
        let comment: OwnedDoc = self
            .get_json(&format!("feed/comments/{}", comment_id))
            .await?;
        Ok(comment.user_id)
    }
}

/// 未配置目录服务时使用：没有群组订阅，归属查询一律 NotFound
pub struct NoDirectory;

#[async_trait]
impl Directory for NoDirectory {
    async fn user_groups(&self, _user_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>> {
        Err(HubError::NotFound(format!("group {}", group_id)))
    }

    async fn post_author(&self, post_id: &str) -> Result<String> {
        Err(HubError::NotFound(format!("post {}", post_id)))
    }

    async fn comment_author(&self, comment_id: &str) -> Result<String> {
        Err(HubError::NotFound(format!("comment {}", comment_id)))
    }
}
