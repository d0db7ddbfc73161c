//! Run lifecycle coordination.
//!
//! The coordinator owns the single active-run slot and wires the pieces of
//! one run together: open the run row, run the optional auth preflight,
//! hand control to the engine, persist the terminal status, emit the
//! terminal stream event, free the slot. A second start while the slot is
//! occupied is refused, never queued.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth;
use crate::engine::{self, LoadPlan, StopCriterion};
use crate::errors::AppError;
use crate::metrics::{ACTIVE_RUN, RUNS_TOTAL};
use crate::model::{AuthSpec, RunRequest};
use crate::store::{NewRun, RunStore};
use crate::stream::{EventHub, StreamEvent};

/// Budget applied when an endpoint sets neither a request budget nor a
/// duration.
const DEFAULT_REQUEST_BUDGET: u64 = 100;

struct ActiveRun {
    run_token: String,
    cancel: CancellationToken,
}

pub struct RunCoordinator {
    store: Arc<RunStore>,
    hub: EventHub,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl RunCoordinator {
    pub fn new(store: Arc<RunStore>, hub: EventHub) -> Self {
        RunCoordinator {
            store,
            hub,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts a run for a stored endpoint, capturing its configuration at
    /// this moment. The endpoint's effective auth spec is its own, falling
    /// back to the owning project's.
    pub fn start_endpoint_run(
        &self,
        endpoint_id: i64,
        users_override: Option<u32>,
    ) -> Result<String, AppError> {
        let endpoint = self
            .store
            .get_endpoint(endpoint_id)?
            .ok_or(AppError::NotFound("Endpoint"))?;

        let auth_spec = if endpoint.requires_auth {
            let effective = match endpoint.auth.clone() {
                Some(spec) => Some(spec),
                None => self
                    .store
                    .get_project(endpoint.project_id)?
                    .and_then(|project| project.auth),
            };
            match effective {
                Some(spec) => Some(spec),
                None => {
                    return Err(AppError::Validation(
                        "Endpoint requires authentication but no auth spec is configured"
                            .to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let users = users_override.unwrap_or(endpoint.users);
        let stop = resolve_stop(endpoint.requests, endpoint.duration_secs)?;
        validate_target(&endpoint.url, users)?;

        self.launch(
            NewRun {
                endpoint_id: Some(endpoint.id),
                url: &endpoint.url,
                method: endpoint.method,
                users,
                target_requests: stop_requests(stop),
                target_duration_secs: stop_duration(stop),
            },
            stop,
            endpoint.headers.clone(),
            endpoint.body.clone(),
            endpoint.content_type.clone(),
            endpoint.insecure,
            auth_spec,
        )
    }

    /// Starts an ad-hoc run from an inline request. An auth spec on the
    /// request enables the preflight.
    pub fn start_adhoc_run(&self, request: &RunRequest) -> Result<String, AppError> {
        let stop = resolve_stop(request.requests, request.duration_secs)?;
        validate_target(&request.url, request.users)?;

        self.launch(
            NewRun {
                endpoint_id: None,
                url: &request.url,
                method: request.method,
                users: request.users,
                target_requests: stop_requests(stop),
                target_duration_secs: stop_duration(stop),
            },
            stop,
            request.headers.clone(),
            request.body.clone(),
            request.content_type.clone(),
            request.insecure,
            request.auth.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        new_run: NewRun,
        stop: StopCriterion,
        headers: Option<std::collections::HashMap<String, String>>,
        body: Option<String>,
        content_type: Option<String>,
        insecure: bool,
        auth_spec: Option<AuthSpec>,
    ) -> Result<String, AppError> {
        // The slot is reserved and the run row opened under one lock so two
        // concurrent starts can never both succeed.
        let mut slot = self.active.lock().expect("active-run slot poisoned");
        if slot.is_some() {
            return Err(AppError::RunInProgress);
        }

        let run = self.store.create_run(&new_run)?;
        let cancel = CancellationToken::new();
        *slot = Some(ActiveRun {
            run_token: run.token.clone(),
            cancel: cancel.clone(),
        });
        drop(slot);
        ACTIVE_RUN.set(1.0);

        info!(
            run_token = %run.token,
            url = %new_run.url,
            users = new_run.users,
            "Run accepted"
        );

        let plan = LoadPlan {
            run_token: run.token.clone(),
            url: new_run.url.to_string(),
            method: new_run.method,
            users: new_run.users,
            stop,
            headers,
            body,
            content_type,
            insecure,
            bearer: None,
        };

        tokio::spawn(drive(
            Arc::clone(&self.store),
            self.hub.clone(),
            Arc::clone(&self.active),
            plan,
            auth_spec,
            cancel,
        ));

        Ok(run.token)
    }

    /// Cancels the active run, if any. Stopping while idle is a successful
    /// no-op.
    pub fn stop(&self) {
        let slot = self.active.lock().expect("active-run slot poisoned");
        if let Some(active) = slot.as_ref() {
            info!(run_token = %active.run_token, "Stop requested");
            active.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().expect("active-run slot poisoned").is_some()
    }

    pub fn active_run_token(&self) -> Option<String> {
        self.active
            .lock()
            .expect("active-run slot poisoned")
            .as_ref()
            .map(|active| active.run_token.clone())
    }
}

fn stop_requests(stop: StopCriterion) -> Option<u64> {
    match stop {
        StopCriterion::Budget(requests) => Some(requests),
        StopCriterion::Duration(_) => None,
    }
}

fn stop_duration(stop: StopCriterion) -> Option<u64> {
    match stop {
        StopCriterion::Duration(secs) => Some(secs),
        StopCriterion::Budget(_) => None,
    }
}

fn validate_target(url: &str, users: u32) -> Result<(), AppError> {
    if url.trim().is_empty() {
        return Err(AppError::Validation("Target URL is required".to_string()));
    }
    if users == 0 {
        return Err(AppError::Validation(
            "User count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Resolves the stop criterion: exactly one of budget and duration, with a
/// default budget of 100 requests when neither is set.
fn resolve_stop(
    requests: Option<u64>,
    duration_secs: Option<u64>,
) -> Result<StopCriterion, AppError> {
    match (requests, duration_secs) {
        (Some(_), Some(_)) => Err(AppError::Validation(
            "A run may set a request budget or a duration, not both".to_string(),
        )),
        (Some(0), None) => Err(AppError::Validation(
            "Request budget must be at least 1".to_string(),
        )),
        (None, Some(0)) => Err(AppError::Validation(
            "Duration must be at least 1 second".to_string(),
        )),
        (Some(requests), None) => Ok(StopCriterion::Budget(requests)),
        (None, Some(secs)) => Ok(StopCriterion::Duration(secs)),
        (None, None) => Ok(StopCriterion::Budget(DEFAULT_REQUEST_BUDGET)),
    }
}

/// Drives one accepted run to a terminal state, then frees the slot.
async fn drive(
    store: Arc<RunStore>,
    hub: EventHub,
    active: Arc<Mutex<Option<ActiveRun>>>,
    mut plan: LoadPlan,
    auth_spec: Option<AuthSpec>,
    cancel: CancellationToken,
) {
    let run_token = plan.run_token.clone();

    if let Some(spec) = auth_spec {
        hub.publish(StreamEvent::AuthenticationStarted {
            run_token: run_token.clone(),
        });
        match auth::fetch_token(&spec, plan.insecure).await {
            Ok(bearer) => {
                hub.publish(StreamEvent::AuthenticationSuccess {
                    run_token: run_token.clone(),
                });
                plan.bearer = Some(bearer);
            }
            Err(e) => {
                let message = e.to_string();
                warn!(run_token = %run_token, error = %message, "Auth preflight failed");
                if let Err(store_err) = store.fail_run(&run_token, &message) {
                    error!(run_token = %run_token, error = %store_err, "Failed to persist run failure");
                }
                RUNS_TOTAL.with_label_values(&["Failed"]).inc();
                hub.publish(StreamEvent::AuthenticationFailed {
                    run_token: run_token.clone(),
                    error: message.clone(),
                });
                hub.publish(StreamEvent::TestError {
                    run_token,
                    error: message,
                });
                release(&active);
                return;
            }
        }
    }

    match engine::run_load(plan, cancel, hub.clone(), Some(Arc::clone(&store))).await {
        Ok(outcome) if outcome.cancelled => {
            // Cancellation is visible through the persisted status only; no
            // terminal stream event is sent.
            if let Err(e) = store.cancel_run(&run_token, &outcome.aggregate) {
                error!(run_token = %run_token, error = %e, "Failed to persist run cancellation");
            }
            RUNS_TOTAL.with_label_values(&["Cancelled"]).inc();
            info!(
                run_token = %run_token,
                total = outcome.aggregate.total_requests,
                "Run cancelled"
            );
        }
        Ok(outcome) => {
            // Persist first: the terminal event must never precede the
            // store transition.
            if let Err(e) = store.complete_run(&run_token, &outcome.aggregate) {
                error!(run_token = %run_token, error = %e, "Failed to persist run completion");
            }
            RUNS_TOTAL.with_label_values(&["Completed"]).inc();
            info!(
                run_token = %run_token,
                total = outcome.aggregate.total_requests,
                peak_rps = outcome.aggregate.requests_per_second,
                "Run completed"
            );
            hub.publish(StreamEvent::TestCompleted(outcome.aggregate));
        }
        Err(e) => {
            let message = e.to_string();
            error!(run_token = %run_token, error = %message, "Engine failure");
            if let Err(store_err) = store.fail_run(&run_token, &message) {
                error!(run_token = %run_token, error = %store_err, "Failed to persist run failure");
            }
            RUNS_TOTAL.with_label_values(&["Failed"]).inc();
            hub.publish(StreamEvent::TestError {
                run_token,
                error: message,
            });
        }
    }

    release(&active);
}

fn release(active: &Mutex<Option<ActiveRun>>) {
    *active.lock().expect("active-run slot poisoned") = None;
    ACTIVE_RUN.set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_resolution_prefers_the_explicit_target() {
        assert_eq!(
            resolve_stop(Some(500), None).unwrap(),
            StopCriterion::Budget(500)
        );
        assert_eq!(
            resolve_stop(None, Some(30)).unwrap(),
            StopCriterion::Duration(30)
        );
    }

    #[test]
    fn stop_resolution_defaults_to_100_requests() {
        assert_eq!(
            resolve_stop(None, None).unwrap(),
            StopCriterion::Budget(DEFAULT_REQUEST_BUDGET)
        );
    }

    #[test]
    fn stop_resolution_rejects_conflicting_targets() {
        assert!(matches!(
            resolve_stop(Some(100), Some(10)),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn stop_resolution_rejects_zero_targets() {
        assert!(matches!(
            resolve_stop(Some(0), None),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            resolve_stop(None, Some(0)),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn target_validation_catches_bad_inputs() {
        assert!(matches!(
            validate_target("", 10),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_target("http://localhost", 0),
            Err(AppError::Validation(_))
        ));
        assert!(validate_target("http://localhost", 1).is_ok());
    }
}
