//! Project and organisation lookups used to scope scan metrics.
use crate::client::{ClientError, HttpClient};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "orgID")]
    pub org_id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Org {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn get_project(&self, project_id: i64) -> Result<Project, ClientError>;
    async fn get_org(&self, org_id: i64) -> Result<Org, ClientError>;
}

pub struct HttpProjectDirectory {
    client: HttpClient,
}

impl HttpProjectDirectory {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProjectDirectory for HttpProjectDirectory {
    async fn get_project(&self, project_id: i64) -> Result<Project, ClientError> {
        let request = self
            .client
            .request(Method::GET, &format!("/api/projects/{project_id}"))?;
        self.client.send_for_data(request).await
    }

    async fn get_org(&self, org_id: i64) -> Result<Org, ClientError> {
        let request = self.client.request(Method::GET, &format!("/api/orgs/{org_id}"))?;
        self.client.send_for_data(request).await
    }
}

/// Directory backed by fixed maps. Unknown ids are `NotFound`.
#[derive(Default)]
pub struct MemoryProjectDirectory {
    projects: RwLock<HashMap<i64, Project>>,
    orgs: RwLock<HashMap<i64, Org>>,
    lookups: RwLock<usize>,
}

impl MemoryProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: Project) {
        self.projects.write().insert(project.id, project);
    }

    pub fn add_org(&self, org: Org) {
        self.orgs.write().insert(org.id, org);
    }

    /// Number of project lookups served so far.
    pub fn lookups(&self) -> usize {
        *self.lookups.read()
    }
}

#[async_trait]
impl ProjectDirectory for MemoryProjectDirectory {
    async fn get_project(&self, project_id: i64) -> Result<Project, ClientError> {
        *self.lookups.write() += 1;
        self.projects
            .read()
            .get(&project_id)
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    async fn get_org(&self, org_id: i64) -> Result<Org, ClientError> {
        self.orgs
            .read()
            .get(&org_id)
            .cloned()
            .ok_or(ClientError::NotFound)
    }
}
