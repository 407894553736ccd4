//! Keeps an application's QA ticket backlog in line with its latest scan.
//!
//! One run covers one application and one flat category. Runs for the same
//! pair are serialized within the process; across pairs they are independent.
//! A run is not transactional: if it stops between purge and recreation the
//! backlog stays partial until the next scan of that application. A failed
//! purge skips recreation, leaving the old backlog in place.
//!
//! The per-pair locks live only while a run for the pair is queued or active.
use crate::client::ClientError;
use crate::metrics_defs::{RECONCILE_DURATION, TICKET_FAILURES, TICKETS_CREATED};
use crate::tickets::{
    LIST_PAGE_SIZE, QA_USER, TARGET_APPLICATION, Ticket, TicketCreateRequest, TicketListRequest,
    TicketService, TicketStatus, TicketType,
};
use crate::types::{Category, Issue, IssueKey};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Deserialize;
use shared::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("{0} issues are not ticketed")]
    NotTicketed(Category),
    #[error("ticket service error: {0}")]
    Tickets(#[from] ClientError),
}

/// Which reconciliation strategy runs after each ingest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    #[default]
    FullReplace,
    DiffBased,
}

/// Everything one reconciliation run needs, captured at ingest time.
#[derive(Clone, Debug)]
pub struct ReconcileJob {
    pub application_id: i64,
    pub branch: String,
    pub category: Category,
    /// The issues the new scan reports for `category`.
    pub issues: Vec<Issue>,
    /// The issues of the application's previous scan, if it had one.
    pub previous: Option<Vec<Issue>>,
}

impl ReconcileJob {
    fn ticket_type(&self) -> Result<TicketType, ReconcileError> {
        TicketType::for_category(self.category).ok_or(ReconcileError::NotTicketed(self.category))
    }

    fn target_id(&self) -> String {
        self.application_id.to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub closed: usize,
    pub failed: usize,
}

#[async_trait]
pub trait ReconcileStrategy: Send + Sync {
    async fn reconcile(
        &self,
        tickets: &dyn TicketService,
        job: &ReconcileJob,
    ) -> Result<ReconcileReport, ReconcileError>;
}

pub fn ticket_title(issue: &Issue) -> String {
    format!("{} (line {} in {})", issue.message, issue.line, issue.path)
}

fn code_language(path: &str) -> &'static str {
    if path.ends_with(".go") {
        "go"
    } else if path.ends_with(".java") || path.ends_with(".kt") {
        "java"
    } else if path.ends_with(".js") {
        "js"
    } else {
        ""
    }
}

fn ticket_request(job: &ReconcileJob, ticket_type: TicketType, issue: &Issue) -> TicketCreateRequest {
    let title = ticket_title(issue);

    let mut label = IndexMap::new();
    label.insert("path".to_string(), issue.path.clone());
    label.insert("message".to_string(), title.clone());
    label.insert("rule".to_string(), issue.rule.clone());
    label.insert("severity".to_string(), issue.severity.clone());
    label.insert("status".to_string(), issue.status.clone());
    label.insert("branch".to_string(), job.branch.clone());
    label.insert("startLine".to_string(), issue.text_range.start_line.to_string());
    label.insert("endLine".to_string(), issue.text_range.end_line.to_string());
    label.insert("line".to_string(), issue.line.to_string());
    label.insert(
        "lineCode".to_string(),
        issue.code.first().cloned().unwrap_or_default(),
    );
    label.insert(
        "code".to_string(),
        format!(
            "```{}\n{}\n```",
            code_language(&issue.path),
            issue.code.join("\n")
        ),
    );

    TicketCreateRequest {
        title,
        ticket_type,
        priority: ticket_type.priority(),
        user_id: QA_USER.to_string(),
        label,
        target_type: TARGET_APPLICATION.to_string(),
        target_id: job.target_id(),
    }
}

async fn create_tickets<'a>(
    tickets: &dyn TicketService,
    job: &ReconcileJob,
    ticket_type: TicketType,
    issues: impl IntoIterator<Item = &'a Issue>,
    report: &mut ReconcileReport,
) {
    for issue in issues {
        let request = ticket_request(job, ticket_type, issue);
        let request_id = uuid::Uuid::new_v4().to_string();

        match tickets.create(&request_id, &request).await {
            Ok(ticket_id) => {
                report.created += 1;
                counter!(TICKETS_CREATED, "category" => job.category.as_str()).increment(1);
                tracing::debug!(ticket_id, title = %request.title, "created ticket");
            }
            Err(e) => {
                report.failed += 1;
                counter!(TICKET_FAILURES, "operation" => "create").increment(1);
                tracing::warn!(
                    application_id = job.application_id,
                    title = %request.title,
                    error = %e,
                    "failed to create ticket"
                );
            }
        }
    }
}

/// Purges every QA ticket of the pair and creates one per reported issue.
pub struct FullReplace;

#[async_trait]
impl ReconcileStrategy for FullReplace {
    async fn reconcile(
        &self,
        tickets: &dyn TicketService,
        job: &ReconcileJob,
    ) -> Result<ReconcileReport, ReconcileError> {
        let ticket_type = job.ticket_type()?;

        // An unpurged backlog would end up with both sets, so stop here.
        if let Err(e) = tickets
            .delete(&job.target_id(), TARGET_APPLICATION, ticket_type)
            .await
        {
            counter!(TICKET_FAILURES, "operation" => "delete").increment(1);
            return Err(e.into());
        }

        let mut report = ReconcileReport::default();
        create_tickets(tickets, job, ticket_type, &job.issues, &mut report).await;
        Ok(report)
    }
}

/// Creates tickets only for issues the previous scan did not report and
/// closes the open tickets of issues the new scan no longer reports.
pub struct DiffBased;

fn keyed(issues: &[Issue]) -> IndexMap<IssueKey, &Issue> {
    issues.iter().map(|issue| (issue.key(), issue)).collect()
}

fn ticket_matches(ticket: &Ticket, issue: &Issue) -> bool {
    let line = issue.line.to_string();
    ticket.creator == QA_USER
        && ticket.title == ticket_title(issue)
        && ticket.label.get("path") == Some(&issue.path)
        && ticket.label.get("rule") == Some(&issue.rule)
        && ticket.label.get("line") == Some(&line)
}

#[async_trait]
impl ReconcileStrategy for DiffBased {
    async fn reconcile(
        &self,
        tickets: &dyn TicketService,
        job: &ReconcileJob,
    ) -> Result<ReconcileReport, ReconcileError> {
        let ticket_type = job.ticket_type()?;
        let current = keyed(&job.issues);
        let previous = job.previous.as_deref().map(keyed).unwrap_or_default();

        let added: Vec<&Issue> = current
            .iter()
            .filter(|(key, _)| !previous.contains_key(*key))
            .map(|(_, issue)| *issue)
            .collect();
        let resolved: Vec<&Issue> = previous
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(_, issue)| *issue)
            .collect();

        let mut report = ReconcileReport::default();
        create_tickets(tickets, job, ticket_type, added, &mut report).await;

        if resolved.is_empty() {
            return Ok(report);
        }

        let open = tickets
            .list(&TicketListRequest {
                ticket_type,
                priority: ticket_type.priority(),
                status: TicketStatus::Open,
                target_type: TARGET_APPLICATION.to_string(),
                target_id: job.target_id(),
                page_size: LIST_PAGE_SIZE,
            })
            .await
            .inspect_err(|_| {
                counter!(TICKET_FAILURES, "operation" => "list").increment(1);
            })?;

        for issue in resolved {
            for ticket in open.iter().filter(|t| ticket_matches(t, issue)) {
                match tickets.close(ticket.ticket_id, QA_USER).await {
                    Ok(()) => {
                        report.closed += 1;
                        tracing::debug!(ticket_id = ticket.ticket_id, "closed resolved ticket");
                    }
                    Err(e) => {
                        report.failed += 1;
                        counter!(TICKET_FAILURES, "operation" => "close").increment(1);
                        tracing::warn!(ticket_id = ticket.ticket_id, error = %e, "failed to close ticket");
                    }
                }
            }
        }

        Ok(report)
    }
}

impl ReconcilePolicy {
    pub fn strategy(&self) -> Arc<dyn ReconcileStrategy> {
        match self {
            ReconcilePolicy::FullReplace => Arc::new(FullReplace),
            ReconcilePolicy::DiffBased => Arc::new(DiffBased),
        }
    }
}

pub struct Reconciler {
    tickets: Arc<dyn TicketService>,
    strategy: Arc<dyn ReconcileStrategy>,
    locks: Mutex<HashMap<(i64, Category), Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(tickets: Arc<dyn TicketService>, strategy: Arc<dyn ReconcileStrategy>) -> Self {
        Reconciler {
            tickets,
            strategy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, application_id: i64, category: Category) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry((application_id, category))
            .or_default()
            .clone()
    }

    /// Drops the pair's lock once no other run holds or waits for it.
    fn release(&self, application_id: i64, category: Category, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&(application_id, category));
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }

    pub async fn run(&self, job: ReconcileJob) -> Result<ReconcileReport, ReconcileError> {
        let lock = self.lock_for(job.application_id, job.category);
        let guard = lock.lock().await;
        let result = self.run_locked(&job).await;
        drop(guard);
        self.release(job.application_id, job.category, lock);
        result
    }

    async fn run_locked(&self, job: &ReconcileJob) -> Result<ReconcileReport, ReconcileError> {
        let start = Instant::now();
        let result = self.strategy.reconcile(self.tickets.as_ref(), job).await;
        histogram!(RECONCILE_DURATION, "category" => job.category.as_str())
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(report) => tracing::info!(
                application_id = job.application_id,
                category = %job.category,
                created = report.created,
                closed = report.closed,
                failed = report.failed,
                "reconciled tickets"
            ),
            Err(e) => tracing::warn!(
                application_id = job.application_id,
                category = %job.category,
                error = %e,
                "ticket reconciliation failed"
            ),
        }

        result
    }
}
