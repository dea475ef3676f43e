//! End-to-end tests of the model service over a scripted backend.

use futures::future::join_all;
use modelhost_foundation::WorkerState;
use modelhost_kernel::{ErrorCode, WorkerTask};
use modelhost_testing::{ServiceFixture, service_config};
use std::time::Duration;

const MODEL: &str = "m1";

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn assigned_to(fixture: &ServiceFixture, model: &str) -> usize {
    fixture
        .service
        .pool()
        .workers()
        .iter()
        .filter(|w| w.assigned_model() == Some(model) && w.state() != WorkerState::Shutdown)
        .count()
}

#[tokio::test]
async fn register_embed_cache_release_walkthrough() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    let service = &fixture.service;

    let registration = service
        .register_model(MODEL, "embedding", 2, "cpu", Some("search"))
        .await
        .into_result()
        .unwrap();
    assert!(registration.new_registration);
    assert!(registration.loaded);
    assert_eq!(registration.workers_created, 2);

    let status = service.get_service_status().into_result().unwrap();
    assert_eq!(status.worker_pool.total_workers, 3);
    let m1 = status
        .models
        .iter()
        .find(|m| m.model_name == MODEL)
        .unwrap();
    assert!(m1.loaded);
    assert_eq!(m1.workers, 2);
    assert_eq!(assigned_to(&fixture, MODEL), 2);

    let first = service
        .generate_embeddings(&texts(&["hello"]), MODEL)
        .await
        .into_result()
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.embeddings.len(), 1);
    assert_eq!(first.embeddings[0].len(), fixture.backend.dimension_for(MODEL));
    assert_eq!(first.dimension, fixture.backend.dimension_for(MODEL));
    let served_by = first.worker_id.clone().unwrap();
    let worker = service
        .pool()
        .workers()
        .into_iter()
        .find(|w| w.id() == served_by)
        .unwrap();
    assert_eq!(worker.assigned_model(), Some(MODEL));

    let inferences = fixture.backend.inference_count(MODEL);
    let second = service
        .generate_embeddings(&texts(&["hello"]), MODEL)
        .await
        .into_result()
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.embeddings, first.embeddings);
    assert!(second.worker_id.is_none());
    assert_eq!(fixture.backend.inference_count(MODEL), inferences);

    let released = service
        .release_model(MODEL, true, Some(Duration::from_secs(5)))
        .await
        .into_result()
        .unwrap();
    assert!(released.drained);
    assert_eq!(released.workers_stopped, 2);
    assert!(service.lifecycle().registration(MODEL).is_none());
    assert_eq!(assigned_to(&fixture, MODEL), 0);

    fixture.stop().await;
}

#[tokio::test]
async fn release_with_slow_consumers_times_out_and_resolves_every_caller() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    fixture
        .backend
        .slow_inference(MODEL, Duration::from_millis(300));
    fixture
        .service
        .register_model(MODEL, "embedding", 2, "cpu", None)
        .await
        .into_result()
        .unwrap();

    let callers: Vec<_> = (0..3)
        .map(|i| {
            let service = fixture.service.clone();
            tokio::spawn(async move {
                service
                    .generate_embeddings(&[format!("text {i}")], MODEL)
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fixture.service.pool().pending_for_model(MODEL) > 0);

    let released = fixture
        .service
        .release_model(MODEL, true, Some(Duration::from_millis(100)))
        .await
        .into_result()
        .unwrap();
    assert!(!released.drained);
    assert!(released.waited_ms >= 100);
    assert!(fixture.service.lifecycle().registration(MODEL).is_none());

    let outcomes = tokio::time::timeout(Duration::from_secs(5), join_all(callers))
        .await
        .expect("every caller resolves");
    let dropped = outcomes
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|response| {
            response
                .error
                .as_ref()
                .is_some_and(|e| e.code == ErrorCode::TaskDropped)
        })
        .count();
    assert_eq!(dropped, released.tasks_dropped);

    fixture.stop().await;
}

#[tokio::test]
async fn concurrent_registrations_share_one_worker_set() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    let service = &fixture.service;

    let (a, b) = tokio::join!(
        service.register_model(MODEL, "embedding", 2, "cpu", Some("a")),
        service.register_model(MODEL, "embedding", 2, "cpu", Some("b")),
    );
    let a = a.into_result().unwrap();
    let b = b.into_result().unwrap();

    assert_eq!(
        [a.new_registration, b.new_registration]
            .iter()
            .filter(|fresh| **fresh)
            .count(),
        1
    );
    let second = if a.new_registration { &b } else { &a };
    assert_eq!(second.reference_count, 2);
    assert_eq!(second.workers_created, 0);
    assert_eq!(assigned_to(&fixture, MODEL), 2);
    assert_eq!(
        service
            .lifecycle()
            .registration(MODEL)
            .unwrap()
            .reference_count,
        2
    );

    fixture.stop().await;
}

#[tokio::test]
async fn every_task_gets_exactly_its_own_result() {
    let fixture = ServiceFixture::start(service_config(3)).await.unwrap();
    let pool = fixture.service.pool().clone();

    let tasks: Vec<WorkerTask> = (0..30)
        .map(|i| {
            let model = if i % 2 == 0 { "embed-a" } else { "embed-b" };
            WorkerTask::embedding(model, vec![format!("text {i}")], 0)
        })
        .collect();
    let ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();

    let results = join_all(tasks.into_iter().map(|task| {
        let pool = pool.clone();
        async move { pool.submit_task(task).await }
    }))
    .await;

    for (id, result) in ids.iter().zip(results) {
        let result = result.unwrap();
        assert_eq!(&result.task_id, id);
        assert!(result.success);
    }

    fixture.stop().await;
}

#[tokio::test]
async fn repeat_registration_adds_a_reference_without_workers() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    let service = &fixture.service;

    let first = service
        .register_model(MODEL, "embedding", 2, "cpu", Some("a"))
        .await
        .into_result()
        .unwrap();
    let second = service
        .register_model(MODEL, "embedding", 2, "cpu", Some("b"))
        .await
        .into_result()
        .unwrap();

    assert!(first.new_registration);
    assert!(!second.new_registration);
    assert!(second.reference_count > first.reference_count);
    assert_eq!(second.workers_created, 0);
    assert_eq!(fixture.backend.load_count(MODEL), 2);

    fixture.stop().await;
}

#[tokio::test]
async fn release_then_register_starts_fresh() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    let service = &fixture.service;

    service
        .register_model(MODEL, "embedding", 3, "cpu", Some("a"))
        .await
        .into_result()
        .unwrap();
    service
        .release_model(MODEL, false, None)
        .await
        .into_result()
        .unwrap();

    let fresh = service
        .register_model(MODEL, "embedding", 1, "cpu", Some("b"))
        .await
        .into_result()
        .unwrap();
    assert!(fresh.new_registration);
    assert_eq!(fresh.reference_count, 1);
    assert_eq!(fresh.workers, 1);
    assert_eq!(assigned_to(&fixture, MODEL), 1);

    let missing = service.release_model("never-registered", true, None).await;
    assert_eq!(missing.error.unwrap().code, ErrorCode::ModelNotFound);

    fixture.stop().await;
}

#[tokio::test]
async fn idle_scanner_respects_references_and_keep_alive() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    let service = &fixture.service;
    let lifecycle = service.lifecycle();
    let keep_alive = Duration::from_secs(service.config().lifecycle.default_keep_alive);

    service
        .register_model(MODEL, "embedding", 1, "cpu", Some("a"))
        .await
        .into_result()
        .unwrap();

    fixture.clock.advance(keep_alive + Duration::from_secs(1));
    assert!(lifecycle.scan_idle_models().await.is_empty());

    service.release_reference(MODEL, Some("a")).into_result().unwrap();
    assert!(lifecycle.scan_idle_models().await.is_empty());

    fixture.clock.advance(keep_alive + Duration::from_secs(1));
    assert_eq!(lifecycle.scan_idle_models().await, vec![MODEL.to_string()]);

    let evicted = lifecycle.registration(MODEL).unwrap();
    assert!(!evicted.loaded);
    assert_eq!(assigned_to(&fixture, MODEL), 0);

    let reloaded = service
        .generate_embeddings(&texts(&["after eviction"]), MODEL)
        .await
        .into_result()
        .unwrap();
    assert_eq!(reloaded.embeddings.len(), 1);
    assert!(lifecycle.registration(MODEL).unwrap().loaded);
    assert_eq!(assigned_to(&fixture, MODEL), 1);

    fixture.stop().await;
}

#[tokio::test]
async fn cache_hits_until_ttl_elapses() {
    let mut config = service_config(1);
    config.embedding_cache.ttl_seconds = 60;
    let fixture = ServiceFixture::start(config).await.unwrap();
    let service = &fixture.service;
    let batch = texts(&["cache me"]);

    let first = service
        .generate_embeddings(&batch, "bge-small")
        .await
        .into_result()
        .unwrap();
    fixture.clock.advance(Duration::from_secs(30));
    let hit = service
        .generate_embeddings(&batch, "bge-small")
        .await
        .into_result()
        .unwrap();
    assert!(hit.cached);
    assert_eq!(hit.embeddings, first.embeddings);

    fixture.clock.advance(Duration::from_secs(31));
    let miss = service
        .generate_embeddings(&batch, "bge-small")
        .await
        .into_result()
        .unwrap();
    assert!(!miss.cached);

    let stats = service.cache().stats();
    assert_eq!(stats.hits, 1);
    assert!(stats.misses >= 2);

    fixture.stop().await;
}

#[tokio::test]
async fn drop_model_queue_cancels_every_waiting_caller() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    fixture
        .backend
        .slow_inference("slow-embed", Duration::from_millis(500));

    let callers: Vec<_> = (0..4)
        .map(|i| {
            let service = fixture.service.clone();
            tokio::spawn(async move {
                service
                    .generate_embeddings(&[format!("queued {i}")], "slow-embed")
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pool = fixture.service.pool();
    let in_flight = pool
        .workers()
        .iter()
        .filter(|w| w.state() == WorkerState::Busy)
        .count();
    let queued = pool.pending_for_model("slow-embed") - in_flight;

    let dropped = fixture
        .service
        .drop_model_queue("slow-embed", "test teardown")
        .into_result()
        .unwrap();
    assert_eq!(dropped.tasks_dropped, queued);
    assert_eq!(dropped.futures_cancelled, queued);

    let outcomes = tokio::time::timeout(Duration::from_secs(5), join_all(callers))
        .await
        .expect("no caller hangs");
    let cancelled = outcomes
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|r| r.error.as_ref().is_some_and(|e| e.code == ErrorCode::TaskDropped))
        .count();
    assert_eq!(cancelled, queued);

    fixture.stop().await;
}

#[tokio::test]
async fn failed_warm_up_keeps_registration_for_retry() {
    let fixture = ServiceFixture::start(service_config(1)).await.unwrap();
    fixture.backend.fail_loads(MODEL, true);

    let failed = fixture
        .service
        .register_model(MODEL, "embedding", 2, "cpu", None)
        .await;
    assert!(!failed.success);
    assert_eq!(failed.error.unwrap().code, ErrorCode::WorkerCreationFailed);
    let registration = fixture.service.lifecycle().registration(MODEL).unwrap();
    assert!(!registration.loaded);
    assert_eq!(assigned_to(&fixture, MODEL), 0);

    fixture.backend.fail_loads(MODEL, false);
    let retried = fixture
        .service
        .register_model(MODEL, "embedding", 2, "cpu", None)
        .await
        .into_result()
        .unwrap();
    assert!(!retried.new_registration);
    assert!(retried.loaded);
    assert_eq!(assigned_to(&fixture, MODEL), 2);

    fixture.stop().await;
}

#[tokio::test]
async fn disabled_pool_serves_through_direct_models() {
    let fixture = ServiceFixture::start(service_config(0)).await.unwrap();
    let service = &fixture.service;

    let response = service
        .generate_text("one two three four", "gpt2", Default::default())
        .await
        .into_result()
        .unwrap();
    assert!(response.worker_id.is_none());
    assert_eq!(response.prompt_tokens, 4);

    let status = service.get_service_status().into_result().unwrap();
    assert!(!status.worker_pool.enabled);
    assert_eq!(status.direct_models.len(), 1);

    fixture.stop().await;
}
