// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the orchestration core: allocation, cancellation,
//! agent death, pool scoping and log streaming against a real database.

mod common;

use std::time::Duration;

use common::*;
use uuid::Uuid;

use tarmac_core::agent::AgentStatus;
use tarmac_core::error::CoreError;
use tarmac_core::job::{JobSpec, JobStatus};
use tarmac_core::logs::{Chunk, GetChunkOptions};
use tarmac_core::pool::UpdatePoolOptions;
use tarmac_core::run::Phase;
use tarmac_core::service::FinishJobOptions;
use tarmac_core::subject::Subject;
use tarmac_core::workspace::Workspace;

fn unique_org() -> String {
    format!("org-{}", Uuid::new_v4().simple())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_plan() {
    skip_if_no_db!();
    let _guard = db_lock().await;
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let org = unique_org();
    let workspace_id = Uuid::new_v4();
    let (pool, secret) = ctx.create_pool_and_token(&org).await;
    let (agent, agent_subject) = ctx.register_pool_agent(&secret, 2).await;

    // the run service enqueues a plan
    let run = ctx.run(&org, &pool, workspace_id);
    ctx.service().create_job(&run).await.unwrap();
    let spec = JobSpec {
        run_id: run.id,
        phase: Phase::Plan,
    };

    // the allocator places the job on the only agent
    let allocated = wait_for(Duration::from_secs(10), || async {
        let job = ctx.db.get_job(&spec).await.unwrap();
        job.status == JobStatus::Allocated && job.agent_id == Some(agent.id)
    })
    .await;
    assert!(allocated, "job was not allocated to the agent");

    // the agent polls and receives the job
    let jobs = ctx
        .service()
        .get_agent_jobs(&agent_subject, agent.id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec, spec);

    // starting the job mints a job token and starts the phase
    let job_token = ctx.service().start_job(&agent_subject, &spec).await.unwrap();
    assert_eq!(ctx.phases.starts(), vec![(run.id, Phase::Plan)]);
    assert_eq!(
        ctx.db.get_job(&spec).await.unwrap().status,
        JobStatus::Running
    );

    let job_subject = ctx
        .service()
        .authenticate_job_token(&job_token)
        .await
        .unwrap();
    assert_eq!(job_subject, Subject::Job(spec));

    // the agent streams chunks; a reader sees the accumulated log
    let logs = ctx.runtime.logs();
    logs.put(Chunk {
        run_id: run.id,
        phase: Phase::Plan,
        data: b"init".to_vec(),
        offset: 0,
    })
    .await
    .unwrap();
    logs.put(Chunk {
        run_id: run.id,
        phase: Phase::Plan,
        data: b"plan".to_vec(),
        offset: 4,
    })
    .await
    .unwrap();
    let streamed = wait_for(Duration::from_secs(10), || async {
        let chunk = logs
            .get(GetChunkOptions {
                run_id: run.id,
                phase: Phase::Plan,
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap();
        chunk.data == b"initplan"
    })
    .await;
    assert!(streamed, "log chunks did not accumulate");

    // finishing reports the phase outcome exactly once
    ctx.service()
        .finish_job(
            &job_subject,
            &spec,
            FinishJobOptions {
                status: JobStatus::Finished,
                error: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(ctx.phases.finishes(), vec![(run.id, Phase::Plan, false)]);
    assert_eq!(
        ctx.db.get_job(&spec).await.unwrap().status,
        JobStatus::Finished
    );
    assert_eq!(ctx.db.get_agent(agent.id).await.unwrap().current_jobs, 0);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_cancel_signals_running_job() {
    skip_if_no_db!();
    let _guard = db_lock().await;
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let org = unique_org();
    let (pool, secret) = ctx.create_pool_and_token(&org).await;
    let (agent, agent_subject) = ctx.register_pool_agent(&secret, 1).await;

    let run = ctx.run(&org, &pool, Uuid::new_v4());
    ctx.service().create_job(&run).await.unwrap();
    let spec = JobSpec {
        run_id: run.id,
        phase: Phase::Plan,
    };
    assert!(
        wait_for(Duration::from_secs(10), || async {
            ctx.db.get_job(&spec).await.unwrap().status == JobStatus::Allocated
        })
        .await
    );
    let job_token = ctx.service().start_job(&agent_subject, &spec).await.unwrap();

    // the agent long-polls with nothing pending, then the user
    // force-cancels the run
    let poller = {
        let service = ctx.service().clone();
        let subject = agent_subject.clone();
        let agent_id = agent.id;
        tokio::spawn(async move { service.get_agent_jobs(&subject, agent_id).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut canceled = run.clone();
    canceled.force_canceled = true;
    ctx.service().cancel_job(&canceled).await.unwrap();

    assert_eq!(
        ctx.db.get_job(&spec).await.unwrap().signaled,
        Some(true),
        "force-cancel should set the signal"
    );

    // the poll returns the signaled job
    let polled = poller.await.unwrap().unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].spec, spec);
    assert_eq!(polled[0].signaled, Some(true));

    // the agent acknowledges by finishing as canceled
    let job_subject = ctx
        .service()
        .authenticate_job_token(&job_token)
        .await
        .unwrap();
    ctx.service()
        .finish_job(
            &job_subject,
            &spec,
            FinishJobOptions {
                status: JobStatus::Canceled,
                error: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(ctx.phases.cancels(), vec![run.id]);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_agent_job_is_reallocated() {
    skip_if_no_db!();
    let _guard = db_lock().await;
    let Some(ctx) = TestContext::new_with_manager().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let org = unique_org();
    let (pool, secret) = ctx.create_pool_and_token(&org).await;

    // agent A takes the job, then goes silent
    let (agent_a, _) = ctx.register_pool_agent(&secret, 1).await;
    let run = ctx.run(&org, &pool, Uuid::new_v4());
    ctx.service().create_job(&run).await.unwrap();
    let spec = JobSpec {
        run_id: run.id,
        phase: Phase::Plan,
    };
    assert!(
        wait_for(Duration::from_secs(10), || async {
            ctx.db.get_job(&spec).await.unwrap().agent_id == Some(agent_a.id)
        })
        .await
    );

    // agent B heartbeats so only A misses its window
    let (agent_b, subject_b) = ctx.register_pool_agent(&secret, 1).await;
    let heartbeat = {
        let service = ctx.service().clone();
        let subject = subject_b.clone();
        let agent_id = agent_b.id;
        tokio::spawn(async move {
            loop {
                service
                    .update_agent_status(&subject, agent_id, AgentStatus::Idle)
                    .await
                    .ok();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    // the manager declares A dead and the allocator moves the job to B
    let reallocated = wait_for(Duration::from_secs(15), || async {
        let job = ctx.db.get_job(&spec).await.unwrap();
        job.agent_id == Some(agent_b.id) && job.status == JobStatus::Allocated
    })
    .await;
    assert!(reallocated, "job was not reallocated to the live agent");

    assert_eq!(
        ctx.db.get_agent(agent_a.id).await.unwrap().status,
        AgentStatus::Errored
    );
    assert_eq!(ctx.db.get_agent(agent_a.id).await.unwrap().current_jobs, 0);
    assert_eq!(ctx.db.get_agent(agent_b.id).await.unwrap().current_jobs, 1);

    heartbeat.abort();
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_scoping_gates_workspaces() {
    skip_if_no_db!();
    let _guard = db_lock().await;
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let org = unique_org();
    let pool = ctx
        .service()
        .create_agent_pool(
            &ctx.user,
            tarmac_core::pool::CreatePoolOptions {
                name: "restricted".to_string(),
                organization: org.clone(),
                organization_scoped: false,
                allowed_workspaces: Vec::new(),
            },
        )
        .await
        .unwrap();

    let workspace = Workspace {
        id: Uuid::new_v4(),
        organization: org.clone(),
        agent_pool_id: Some(pool.id),
    };

    // not granted: configuring the workspace with this pool must fail
    let refused = ctx.service().check_workspace_pool_access(&workspace).await;
    assert!(matches!(
        refused,
        Err(CoreError::WorkspaceNotAllowedToUsePool)
    ));

    // granting the workspace makes the same check pass
    ctx.service()
        .update_agent_pool(
            &ctx.user,
            pool.id,
            UpdatePoolOptions {
                allowed_workspaces: Some(vec![workspace.id]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    ctx.service()
        .check_workspace_pool_access(&workspace)
        .await
        .unwrap();

    // a pool referenced by a workspace cannot be deleted
    ctx.db
        .add_assigned_workspace(pool.id, workspace.id)
        .await
        .unwrap();
    let refused = ctx.service().delete_agent_pool(&ctx.user, pool.id).await;
    assert!(matches!(
        refused,
        Err(CoreError::PoolReferencedByWorkspaces)
    ));

    ctx.db
        .remove_assigned_workspace(pool.id, workspace.id)
        .await
        .unwrap();
    ctx.service()
        .delete_agent_pool(&ctx.user, pool.id)
        .await
        .unwrap();

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_phase_log_overwrites_stale_cache() {
    skip_if_no_db!();
    let _guard = db_lock().await;
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let run_id = Uuid::new_v4();
    let logs = ctx.runtime.logs();

    logs.put(Chunk {
        run_id,
        phase: Phase::Plan,
        data: b"stale".to_vec(),
        offset: 0,
    })
    .await
    .unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || async {
            let chunk = logs
                .get(GetChunkOptions {
                    run_id,
                    phase: Phase::Plan,
                    offset: 0,
                    limit: 0,
                })
                .await
                .unwrap();
            chunk.data == b"stale"
        })
        .await
    );

    // the phase re-runs; its start chunk replaces the cached stream
    logs.put(Chunk {
        run_id,
        phase: Phase::Plan,
        data: b"new".to_vec(),
        offset: 0,
    })
    .await
    .unwrap();
    let overwritten = wait_for(Duration::from_secs(10), || async {
        let chunk = logs
            .get(GetChunkOptions {
                run_id,
                phase: Phase::Plan,
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap();
        chunk.data == b"new"
    })
    .await;
    assert!(overwritten, "start chunk did not replace the stale cache");

    ctx.shutdown().await;
}
