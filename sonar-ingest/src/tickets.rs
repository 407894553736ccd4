//! Client side of the external ticket service.
//!
//! The ticket service owns tickets; this crate only creates, lists, closes
//! and bulk-deletes the QA-owned tickets of an application.
use crate::client::{ClientError, HttpClient};
use crate::types::Category;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// The system user that creates and closes scan tickets.
pub const QA_USER: &str = "qa";

/// Target type of every ticket created from a scan.
pub const TARGET_APPLICATION: &str = "application";

/// Page size used when listing an application's open tickets.
pub const LIST_PAGE_SIZE: u32 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TicketType {
    Bug,
    CodeSmell,
    Vulnerability,
}

impl TicketType {
    pub fn for_category(category: Category) -> Option<Self> {
        match category {
            Category::Bugs => Some(TicketType::Bug),
            Category::CodeSmells => Some(TicketType::CodeSmell),
            Category::Vulnerabilities => Some(TicketType::Vulnerability),
            Category::Coverage | Category::Duplications => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            TicketType::Bug => "bug",
            TicketType::CodeSmell => "codeSmell",
            TicketType::Vulnerability => "vulnerability",
        }
    }

    /// Bugs are the most urgent, vulnerabilities the least.
    pub const fn priority(&self) -> TicketPriority {
        match self {
            TicketType::Bug => TicketPriority::High,
            TicketType::CodeSmell => TicketPriority::Medium,
            TicketType::Vulnerability => TicketPriority::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    High,
    Medium,
    Low,
}

impl TicketPriority {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::High => "high",
            TicketPriority::Medium => "medium",
            TicketPriority::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    #[default]
    Open,
    Closed,
}

impl TicketStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreateRequest {
    pub title: String,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub label: IndexMap<String, String>,
    pub target_type: String,
    #[serde(rename = "targetID")]
    pub target_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    #[serde(rename = "ticketID")]
    pub ticket_id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub label: IndexMap<String, String>,
    #[serde(default)]
    pub target_type: String,
    #[serde(default, rename = "targetID")]
    pub target_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TicketListRequest {
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub target_type: String,
    pub target_id: String,
    pub page_size: u32,
}

#[async_trait]
pub trait TicketService: Send + Sync {
    /// Creates a ticket and returns its id. `request_id` makes the call
    /// idempotent on the service side.
    async fn create(&self, request_id: &str, request: &TicketCreateRequest)
    -> Result<i64, ClientError>;

    /// Deletes every ticket of `ticket_type` attached to the target.
    async fn delete(
        &self,
        target_id: &str,
        target_type: &str,
        ticket_type: TicketType,
    ) -> Result<(), ClientError>;

    async fn list(&self, request: &TicketListRequest) -> Result<Vec<Ticket>, ClientError>;

    async fn close(&self, ticket_id: i64, operator: &str) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct TicketPage {
    #[serde(default)]
    tickets: Vec<Ticket>,
}

pub struct HttpTicketService {
    client: HttpClient,
}

impl HttpTicketService {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TicketService for HttpTicketService {
    async fn create(
        &self,
        request_id: &str,
        request: &TicketCreateRequest,
    ) -> Result<i64, ClientError> {
        let builder = self
            .client
            .request(Method::POST, "/api/tickets")?
            .header("User-ID", &request.user_id)
            .header("X-Request-Id", request_id)
            .json(request);
        self.client.send_for_data(builder).await
    }

    async fn delete(
        &self,
        target_id: &str,
        target_type: &str,
        ticket_type: TicketType,
    ) -> Result<(), ClientError> {
        let builder = self
            .client
            .request(Method::DELETE, "/api/tickets/actions/batch-delete")?
            .query(&[
                ("targetID", target_id),
                ("targetType", target_type),
                ("type", ticket_type.as_str()),
            ]);
        self.client.send::<serde_json::Value>(builder).await?;
        Ok(())
    }

    async fn list(&self, request: &TicketListRequest) -> Result<Vec<Ticket>, ClientError> {
        let page_size = request.page_size.to_string();
        let builder = self
            .client
            .request(Method::GET, "/api/tickets")?
            .query(&[
                ("type", request.ticket_type.as_str()),
                ("priority", request.priority.as_str()),
                ("status", request.status.as_str()),
                ("targetType", request.target_type.as_str()),
                ("targetID", request.target_id.as_str()),
                ("pageSize", page_size.as_str()),
            ]);
        let page: TicketPage = self.client.send_for_data(builder).await?;
        Ok(page.tickets)
    }

    async fn close(&self, ticket_id: i64, operator: &str) -> Result<(), ClientError> {
        let builder = self
            .client
            .request(Method::PUT, &format!("/api/tickets/{ticket_id}/actions/close"))?
            .header("User-ID", operator);
        self.client.send::<serde_json::Value>(builder).await?;
        Ok(())
    }
}

/// Request ids remembered for idempotent creates; older ones are forgotten.
const REMEMBERED_REQUESTS: usize = 1_024;

#[derive(Default)]
struct Backlog {
    next_id: i64,
    tickets: Vec<Ticket>,
    by_request: IndexMap<String, i64>,
    failing_titles: HashSet<String>,
    fail_deletes: bool,
    create_calls: usize,
}

/// Ticket service held in memory. Failures can be injected per title (for
/// creates) or for all deletes.
#[derive(Default)]
pub struct MemoryTicketService {
    backlog: Mutex<Backlog>,
    latency: Option<Duration>,
}

impl MemoryTicketService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` first, so concurrent callers interleave.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            backlog: Mutex::default(),
            latency: Some(latency),
        }
    }

    pub fn fail_creates_titled(&self, title: &str) {
        self.backlog.lock().failing_titles.insert(title.to_string());
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.backlog.lock().fail_deletes = fail;
    }

    /// Adds an existing ticket, as if it had been created earlier.
    pub fn seed(&self, mut ticket: Ticket) -> i64 {
        let mut backlog = self.backlog.lock();
        backlog.next_id += 1;
        ticket.ticket_id = backlog.next_id;
        backlog.tickets.push(ticket);
        backlog.next_id
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.backlog.lock().tickets.clone()
    }

    pub fn tickets_of(&self, target_id: &str, ticket_type: TicketType) -> Vec<Ticket> {
        self.backlog
            .lock()
            .tickets
            .iter()
            .filter(|t| t.target_id == target_id && t.ticket_type == ticket_type)
            .cloned()
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.backlog.lock().create_calls
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TicketService for MemoryTicketService {
    async fn create(
        &self,
        request_id: &str,
        request: &TicketCreateRequest,
    ) -> Result<i64, ClientError> {
        self.delay().await;

        let mut backlog = self.backlog.lock();
        backlog.create_calls += 1;

        if backlog.failing_titles.contains(&request.title) {
            return Err(ClientError::Unavailable(format!(
                "ticket {:?} rejected",
                request.title
            )));
        }
        if let Some(&id) = backlog.by_request.get(request_id) {
            return Ok(id);
        }

        backlog.next_id += 1;
        let id = backlog.next_id;
        backlog.tickets.push(Ticket {
            ticket_id: id,
            title: request.title.clone(),
            ticket_type: request.ticket_type,
            priority: request.priority,
            status: TicketStatus::Open,
            creator: request.user_id.clone(),
            label: request.label.clone(),
            target_type: request.target_type.clone(),
            target_id: request.target_id.clone(),
        });
        backlog.by_request.insert(request_id.to_string(), id);
        if backlog.by_request.len() > REMEMBERED_REQUESTS {
            backlog.by_request.shift_remove_index(0);
        }
        Ok(id)
    }

    async fn delete(
        &self,
        target_id: &str,
        target_type: &str,
        ticket_type: TicketType,
    ) -> Result<(), ClientError> {
        self.delay().await;

        let mut backlog = self.backlog.lock();
        if backlog.fail_deletes {
            return Err(ClientError::Unavailable("ticket delete rejected".into()));
        }
        backlog.tickets.retain(|t| {
            !(t.target_id == target_id
                && t.target_type == target_type
                && t.ticket_type == ticket_type)
        });
        Ok(())
    }

    async fn list(&self, request: &TicketListRequest) -> Result<Vec<Ticket>, ClientError> {
        self.delay().await;

        Ok(self
            .backlog
            .lock()
            .tickets
            .iter()
            .filter(|t| {
                t.ticket_type == request.ticket_type
                    && t.priority == request.priority
                    && t.status == request.status
                    && t.target_type == request.target_type
                    && t.target_id == request.target_id
            })
            .take(request.page_size as usize)
            .cloned()
            .collect())
    }

    async fn close(&self, ticket_id: i64, _operator: &str) -> Result<(), ClientError> {
        self.delay().await;

        let mut backlog = self.backlog.lock();
        match backlog.tickets.iter_mut().find(|t| t.ticket_id == ticket_id) {
            Some(ticket) => {
                ticket.status = TicketStatus::Closed;
                Ok(())
            }
            None => Err(ClientError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: &str, target_id: &str, ticket_type: TicketType) -> TicketCreateRequest {
        TicketCreateRequest {
            title: title.to_string(),
            ticket_type,
            priority: ticket_type.priority(),
            user_id: QA_USER.to_string(),
            label: IndexMap::new(),
            target_type: TARGET_APPLICATION.to_string(),
            target_id: target_id.to_string(),
        }
    }

    #[test]
    fn test_create_request_wire_format() {
        let mut req = request("nil dereference (line 3 in a.go)", "7", TicketType::CodeSmell);
        req.label.insert("path".into(), "a.go".into());

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "codeSmell");
        assert_eq!(value["priority"], "medium");
        assert_eq!(value["userID"], "qa");
        assert_eq!(value["targetType"], "application");
        assert_eq!(value["targetID"], "7");
        assert_eq!(value["label"]["path"], "a.go");
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            TicketType::for_category(Category::Bugs).map(|t| t.priority()),
            Some(TicketPriority::High)
        );
        assert_eq!(
            TicketType::for_category(Category::Vulnerabilities).map(|t| t.priority()),
            Some(TicketPriority::Low)
        );
        assert_eq!(TicketType::for_category(Category::Coverage), None);
    }

    #[tokio::test]
    async fn test_memory_service_delete_scope() {
        let service = MemoryTicketService::new();
        service.create("r1", &request("a", "7", TicketType::Bug)).await.unwrap();
        service.create("r2", &request("b", "7", TicketType::CodeSmell)).await.unwrap();
        service.create("r3", &request("c", "8", TicketType::Bug)).await.unwrap();

        service.delete("7", TARGET_APPLICATION, TicketType::Bug).await.unwrap();

        let titles: Vec<_> = service.tickets().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_memory_service_request_id_is_idempotent() {
        let service = MemoryTicketService::new();
        let first = service.create("r1", &request("a", "7", TicketType::Bug)).await.unwrap();
        let again = service.create("r1", &request("a", "7", TicketType::Bug)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(service.tickets().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_service_forgets_old_request_ids() {
        let service = MemoryTicketService::new();
        for n in 0..=REMEMBERED_REQUESTS {
            service
                .create(&format!("r{n}"), &request("a", "7", TicketType::Bug))
                .await
                .unwrap();
        }
        assert_eq!(service.backlog.lock().by_request.len(), REMEMBERED_REQUESTS);

        // "r0" was evicted, so it creates a new ticket; the newest is still known.
        service.create("r0", &request("a", "7", TicketType::Bug)).await.unwrap();
        let latest = format!("r{REMEMBERED_REQUESTS}");
        service.create(&latest, &request("a", "7", TicketType::Bug)).await.unwrap();
        assert_eq!(service.tickets().len(), REMEMBERED_REQUESTS + 2);
    }

    #[tokio::test]
    async fn test_memory_service_list_and_close() {
        let service = MemoryTicketService::new();
        let id = service.create("r1", &request("a", "7", TicketType::Bug)).await.unwrap();
        service.fail_creates_titled("b");
        assert!(service.create("r2", &request("b", "7", TicketType::Bug)).await.is_err());

        let open = TicketListRequest {
            ticket_type: TicketType::Bug,
            priority: TicketPriority::High,
            status: TicketStatus::Open,
            target_type: TARGET_APPLICATION.to_string(),
            target_id: "7".to_string(),
            page_size: LIST_PAGE_SIZE,
        };
        assert_eq!(service.list(&open).await.unwrap().len(), 1);

        service.close(id, QA_USER).await.unwrap();
        assert!(service.list(&open).await.unwrap().is_empty());
        assert!(matches!(
            service.close(99, QA_USER).await,
            Err(ClientError::NotFound)
        ));
        assert_eq!(service.create_calls(), 2);
    }
}
