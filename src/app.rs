//! External façade.
//!
//! The operation set consumed by the CLI and HTTP adapters. Thin by design:
//! validation and orchestration live in the coordinator and the store; this
//! layer resolves lookup misses into `NotFound` and keeps the adapters free
//! of wiring.

use std::sync::Arc;

use crate::auth::{self, AuthError};
use crate::errors::AppError;
use crate::lifecycle::RunCoordinator;
use crate::model::{
    AuthSpec, Endpoint, EndpointDraft, Project, ProjectDraft, ProjectExport, Run, RunDetails,
    RunFilter, RunRequest, RunStatistics, RunTimeline,
};
use crate::store::RunStore;
use crate::stream::{EventHub, Subscription};

pub struct App {
    store: Arc<RunStore>,
    hub: EventHub,
    coordinator: RunCoordinator,
}

impl App {
    pub fn new(store: RunStore) -> Self {
        let store = Arc::new(store);
        let hub = EventHub::new();
        let coordinator = RunCoordinator::new(Arc::clone(&store), hub.clone());
        App {
            store,
            hub,
            coordinator,
        }
    }

    // --- Run control ---

    pub fn start_endpoint_run(
        &self,
        endpoint_id: i64,
        users_override: Option<u32>,
    ) -> Result<String, AppError> {
        self.coordinator.start_endpoint_run(endpoint_id, users_override)
    }

    pub fn start_adhoc_run(&self, request: &RunRequest) -> Result<String, AppError> {
        self.coordinator.start_adhoc_run(request)
    }

    /// Stops the active run, if any; a no-op otherwise.
    pub fn stop_run(&self) {
        self.coordinator.stop()
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    pub fn active_run_token(&self) -> Option<String> {
        self.coordinator.active_run_token()
    }

    /// Performs the auth preflight without starting a run, returning the
    /// prefixed token value on success.
    pub async fn test_auth(&self, spec: &AuthSpec, insecure: bool) -> Result<String, AuthError> {
        auth::fetch_token(spec, insecure).await.map(|t| t.value)
    }

    /// Attaches a live-feed subscriber.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    // --- Projects ---

    pub fn list_projects(&self) -> Result<Vec<Project>, AppError> {
        Ok(self.store.list_projects()?)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, AppError> {
        Ok(self.store.get_project(id)?)
    }

    pub fn create_project(&self, draft: &ProjectDraft) -> Result<Project, AppError> {
        if draft.name.trim().is_empty() {
            return Err(AppError::Validation("Project name is required".to_string()));
        }
        Ok(self.store.create_project(draft)?)
    }

    pub fn update_project(&self, id: i64, draft: &ProjectDraft) -> Result<Project, AppError> {
        if draft.name.trim().is_empty() {
            return Err(AppError::Validation("Project name is required".to_string()));
        }
        self.store
            .update_project(id, draft)?
            .ok_or(AppError::NotFound("Project"))
    }

    pub fn delete_project(&self, id: i64) -> Result<(), AppError> {
        if self.store.delete_project(id)? {
            Ok(())
        } else {
            Err(AppError::NotFound("Project"))
        }
    }

    pub fn set_project_auth(&self, id: i64, spec: &AuthSpec) -> Result<Project, AppError> {
        self.store
            .set_project_auth(id, spec)?
            .ok_or(AppError::NotFound("Project"))
    }

    pub fn clear_project_auth(&self, id: i64) -> Result<Project, AppError> {
        self.store
            .clear_project_auth(id)?
            .ok_or(AppError::NotFound("Project"))
    }

    // --- Endpoints ---

    pub fn list_endpoints(&self, project_id: i64) -> Result<Vec<Endpoint>, AppError> {
        Ok(self.store.list_endpoints(project_id)?)
    }

    pub fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>, AppError> {
        Ok(self.store.get_endpoint(id)?)
    }

    pub fn create_endpoint(
        &self,
        project_id: i64,
        draft: &EndpointDraft,
    ) -> Result<Endpoint, AppError> {
        validate_endpoint_draft(draft)?;
        self.store
            .create_endpoint(project_id, draft)?
            .ok_or(AppError::NotFound("Project"))
    }

    pub fn update_endpoint(&self, id: i64, draft: &EndpointDraft) -> Result<Endpoint, AppError> {
        validate_endpoint_draft(draft)?;
        self.store
            .update_endpoint(id, draft)?
            .ok_or(AppError::NotFound("Endpoint"))
    }

    pub fn delete_endpoint(&self, id: i64) -> Result<(), AppError> {
        if self.store.delete_endpoint(id)? {
            Ok(())
        } else {
            Err(AppError::NotFound("Endpoint"))
        }
    }

    // --- Runs ---

    pub fn list_recent_runs(&self, limit: u32) -> Result<Vec<Run>, AppError> {
        Ok(self.store.list_recent_runs(limit)?)
    }

    pub fn search_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError> {
        Ok(self.store.search_runs(filter)?)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<RunDetails>, AppError> {
        Ok(self.store.get_run_details(id)?)
    }

    pub fn get_run_by_token(&self, token: &str) -> Result<Option<Run>, AppError> {
        Ok(self.store.get_run_by_token(token)?)
    }

    pub fn get_run_timeline(&self, id: i64) -> Result<Option<RunTimeline>, AppError> {
        Ok(self.store.get_run_with_snapshots(id)?)
    }

    pub fn delete_run(&self, id: i64) -> Result<(), AppError> {
        if self.store.delete_run(id)? {
            Ok(())
        } else {
            Err(AppError::NotFound("Run"))
        }
    }

    pub fn run_statistics(
        &self,
        project_id: Option<i64>,
        endpoint_id: Option<i64>,
    ) -> Result<RunStatistics, AppError> {
        Ok(self.store.run_statistics(project_id, endpoint_id)?)
    }

    // --- Export / import ---

    pub fn export_project(&self, id: i64) -> Result<ProjectExport, AppError> {
        self.store
            .export_project(id)?
            .ok_or(AppError::NotFound("Project"))
    }

    pub fn import_project(&self, payload: &ProjectExport) -> Result<Project, AppError> {
        Ok(self.store.import_project(payload)?)
    }
}

fn validate_endpoint_draft(draft: &EndpointDraft) -> Result<(), AppError> {
    if draft.name.trim().is_empty() {
        return Err(AppError::Validation("Endpoint name is required".to_string()));
    }
    if draft.url.trim().is_empty() {
        return Err(AppError::Validation("Endpoint URL is required".to_string()));
    }
    if draft.users == 0 {
        return Err(AppError::Validation(
            "User count must be at least 1".to_string(),
        ));
    }
    if draft.requests.is_some() && draft.duration_secs.is_some() {
        return Err(AppError::Validation(
            "An endpoint may set a request budget or a duration, not both".to_string(),
        ));
    }
    Ok(())
}
