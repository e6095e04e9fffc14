//! One-shot operator commands.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;

use crier_scheduler::{RetryPolicy, Scheduler, SchedulerConfig};
use crier_store::{Post, Store, TargetBinding};
use crier_workflow::{PublishService, ScheduleRequest, WorkflowConfig};

use crate::EngineSettings;
use crate::post_file::PostFile;

pub fn open_store(settings: &EngineSettings) -> Result<Arc<Store>> {
    let store = Store::open(&settings.database).map_err(|e| miette::miette!("{}", e))?;
    Ok(Arc::new(store))
}

pub fn scheduler_config(settings: &EngineSettings) -> SchedulerConfig {
    SchedulerConfig {
        retry: RetryPolicy {
            max_retries: settings.max_retries,
            base_delay: Duration::seconds(settings.retry_base_secs as i64),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn workflow_config(settings: &EngineSettings) -> WorkflowConfig {
    WorkflowConfig {
        grace_period: Duration::seconds(settings.grace_period_secs as i64),
        ..Default::default()
    }
}

/// Reject retry settings whose backoff outlasts the grace period.
///
/// The watchdog defers while a retry is pending, so a longer window only
/// postpones failure detection past the configured grace period.
pub fn validate(settings: &EngineSettings) -> Result<()> {
    let backoff = scheduler_config(settings).retry.total_backoff();
    let grace = workflow_config(settings).grace_period;
    if backoff >= grace {
        return Err(miette::miette!(
            "retry backoff of {}s (--max-retries {}, --retry-base-secs {}) must be shorter than the {}s grace period",
            backoff.num_seconds(),
            settings.max_retries,
            settings.retry_base_secs,
            grace.num_seconds()
        ));
    }
    Ok(())
}

/// Service over the configured database, without job handlers.
fn service(settings: &EngineSettings) -> Result<(Arc<Store>, PublishService)> {
    let store = open_store(settings)?;
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        scheduler_config(settings),
    ));
    Ok((store, PublishService::new(scheduler, workflow_config(settings))))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{}", json);
    Ok(())
}

pub fn create_post(settings: &EngineSettings, file: &Path) -> Result<Post> {
    let raw = std::fs::read_to_string(file).into_diagnostic()?;
    let parsed: PostFile = serde_json::from_str(&raw)
        .map_err(|e| miette::miette!("invalid post file {}: {}", file.display(), e))?;
    let (post, overrides) = parsed.into_post();

    let (_, service) = service(settings)?;
    service
        .create_post(&post, &overrides)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)?;
    Ok(post)
}

pub fn schedule(settings: &EngineSettings, post_id: &str, at: DateTime<Utc>) -> Result<()> {
    let (_, service) = service(settings)?;
    let post = service
        .schedule(&ScheduleRequest {
            post_id: post_id.to_string(),
            scheduled_for: at,
        })
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn reschedule(settings: &EngineSettings, post_id: &str, at: DateTime<Utc>) -> Result<()> {
    let (_, service) = service(settings)?;
    let post = service
        .reschedule(post_id, at)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn unschedule(settings: &EngineSettings, post_id: &str) -> Result<()> {
    let (_, service) = service(settings)?;
    let post = service
        .unschedule(post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn delete(settings: &EngineSettings, post_id: &str) -> Result<()> {
    let (_, service) = service(settings)?;
    let post = service
        .delete_post(post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    println!("deleted post {} ({})", post.id, post.status);
    Ok(())
}

pub fn status(settings: &EngineSettings, post_id: &str) -> Result<()> {
    let (_, service) = service(settings)?;
    let report = service
        .report(post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&report)
}

pub fn bind(settings: &EngineSettings, user_id: &str, target: &str, binding_ref: &str) -> Result<()> {
    let store = open_store(settings)?;
    store
        .upsert_binding(&TargetBinding {
            user_id: user_id.to_string(),
            target: target.to_string(),
            binding_ref: binding_ref.to_string(),
            active: true,
        })
        .map_err(|e| miette::miette!("{}", e))?;
    println!("bound {} for {}", target, user_id);
    Ok(())
}

pub fn unbind(settings: &EngineSettings, user_id: &str, target: &str) -> Result<()> {
    let store = open_store(settings)?;
    let changed = store
        .deactivate_binding(user_id, target)
        .map_err(|e| miette::miette!("{}", e))?;
    if !changed {
        return Err(miette::miette!("no binding for {} on {}", user_id, target));
    }
    println!("unbound {} for {}", target, user_id);
    Ok(())
}

pub fn prefs(settings: &EngineSettings, user_id: &str, notify_on_failure: bool) -> Result<()> {
    let store = open_store(settings)?;
    store
        .upsert_user(user_id, notify_on_failure)
        .map_err(|e| miette::miette!("{}", e))?;
    println!("notify_on_failure = {} for {}", notify_on_failure, user_id);
    Ok(())
}
