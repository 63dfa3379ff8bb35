use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sandcastle_core::{ProjectId, UserId};
use sandcastle_infra::agent::InMemoryAgent;
use sandcastle_infra::config::SandcastleConfig;
use sandcastle_infra::jobs::payload::{ProductionBuild, ProjectCreate, ProjectDelete};
use sandcastle_infra::jobs::{InMemoryJobStore, JobFilter, JobState, JobType};
use sandcastle_infra::project_store::{InMemoryProjectStore, ProjectStore};
use sandcastle_infra::runtime::InMemoryRuntime;
use sandcastle_projects::{Project, ProductionStatus, ProjectStatus};
use sandcastle_worker::app::{self, RunningApp, Services};

struct TestApp {
    app: RunningApp,
    projects: Arc<InMemoryProjectStore>,
    runtime: Arc<InMemoryRuntime>,
    agent: Arc<InMemoryAgent>,
    _root: tempfile::TempDir,
}

async fn start(workers: usize) -> TestApp {
    let root = tempfile::tempdir().unwrap();
    let vars: HashMap<String, String> = [
        ("SANDCASTLE_WORKSPACE_ROOT", root.path().to_str().unwrap()),
        ("SANDCASTLE_WORKERS", &workers.to_string()),
        ("SANDCASTLE_CONCURRENCY", "4"),
        ("SANDCASTLE_WORKER_PREFIX", "it"),
        ("SANDCASTLE_POLL_MS", "10"),
        ("SANDCASTLE_READY_POLL_MS", "10"),
        ("SANDCASTLE_PROMPT_POLL_MS", "10"),
        ("SANDCASTLE_SHUTDOWN_GRACE_MS", "1000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = SandcastleConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let projects = Arc::new(InMemoryProjectStore::new());
    let runtime = Arc::new(InMemoryRuntime::new());
    let agent = Arc::new(InMemoryAgent::new());
    let services = Services {
        jobs: Arc::new(InMemoryJobStore::new()),
        projects: projects.clone(),
        runtime: runtime.clone(),
        agent: agent.clone(),
    };

    TestApp {
        app: app::start(&config, services).await.unwrap(),
        projects,
        runtime,
        agent,
        _root: root,
    }
}

async fn wait_for<F>(projects: &InMemoryProjectStore, id: &ProjectId, done: F) -> Project
where
    F: Fn(&Project) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(project) = projects.get(id).await.unwrap() {
            if done(&project) {
                return project;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "project {id} did not settle in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn create_payload(id: &str) -> ProjectCreate {
    ProjectCreate {
        project_id: ProjectId::parse(id).unwrap(),
        owner_user_id: UserId::parse("u1").unwrap(),
        name: Some("Todo".to_string()),
        prompt: "build a todo app".to_string(),
        model: "anthropic/claude-sonnet-4".to_string(),
        images: vec![],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_runs_the_whole_chain_to_idle() {
    let t = start(2).await;
    let id = ProjectId::parse("p1").unwrap();
    t.app.queue().project_create(create_payload("p1")).await.unwrap();

    let project = wait_for(&t.projects, &id, |p| p.status == ProjectStatus::Idle).await;
    let session = project.session_id.clone().unwrap();
    assert_eq!(t.agent.prompts(&session).len(), 2);
    assert!(t.runtime.is_up("sc-p1"));

    let jobs = t
        .app
        .admin()
        .list(&JobFilter::default().for_project(id))
        .await
        .unwrap();
    for job_type in [
        JobType::ProjectCreate,
        JobType::DockerComposeUp,
        JobType::DockerWaitReady,
        JobType::OpencodeSessionCreate,
        JobType::OpencodeSendInitialPrompt,
        JobType::OpencodeSendUserPrompt,
    ] {
        assert!(
            jobs.iter()
                .any(|j| j.job_type == job_type.as_str() && j.state == JobState::Succeeded),
            "{job_type} did not succeed"
        );
    }

    let worker_ids = t.app.worker_ids();
    assert_eq!(worker_ids.len(), 2);
    assert!(worker_ids.iter().all(|w| w.starts_with("it-")));

    t.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn production_build_reaches_running_and_delete_cleans_up() {
    let t = start(1).await;
    let id = ProjectId::parse("p2").unwrap();
    t.app.queue().project_create(create_payload("p2")).await.unwrap();
    wait_for(&t.projects, &id, |p| p.status == ProjectStatus::Idle).await;

    t.app
        .queue()
        .production_build(ProductionBuild {
            project_id: id.clone(),
            production_port: 8100,
        })
        .await
        .unwrap();
    let project = wait_for(&t.projects, &id, |p| {
        p.production
            .as_ref()
            .is_some_and(|d| d.status == ProductionStatus::Running)
    })
    .await;
    let deployment = project.production.unwrap();
    assert_eq!(deployment.url.as_deref(), Some("http://localhost:8100"));

    t.app
        .queue()
        .project_delete(ProjectDelete::new(id.clone()))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while t.projects.get(&id).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "project was not deleted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(t.runtime.groups().is_empty());

    t.app.shutdown().await;
}

#[tokio::test]
async fn shutdown_with_an_empty_queue_returns() {
    let t = start(3).await;
    let stats = t.app.stats();
    assert_eq!(stats.len(), 3);

    tokio::time::timeout(Duration::from_secs(5), t.app.shutdown())
        .await
        .unwrap();
}
