//! Integration tests against a real Postgres with pgvector.
//!
//! Run with a database available:
//!   DATABASE_URL=postgres://localhost/docdex_test \
//!     cargo test -p docdex-store -- --ignored

use chrono::Utc;
use uuid::Uuid;

use docdex_shared::{AccessLevel, Identity, IndexName, JobProgress, JobStatus};
use docdex_store::{AccessGrant, ChunkRecord, JobUpdate, NewJob, Store};

async fn test_store() -> Store {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    Store::connect(&url).await.expect("connect test store")
}

fn unique_index(prefix: &str) -> IndexName {
    let suffix = Uuid::now_v7().simple().to_string();
    IndexName::parse(&format!("{prefix}-{}", &suffix[..12])).expect("valid index name")
}

fn chunk(url: &str, content: &str, embedding: Vec<f32>) -> ChunkRecord {
    ChunkRecord {
        url: url.into(),
        title: "Test Page".into(),
        content: content.into(),
        embedding,
        metadata: serde_json::json!({"source": url, "type": "html"}),
    }
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn ensure_store_is_idempotent_and_recreates_on_dimension_change() {
    let store = test_store().await;
    let index = unique_index("dim");

    store.ensure_store(&index, 3).await.unwrap();
    store
        .upsert_chunk(&index, &chunk("https://x.test/a#1", "alpha", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();

    // Same dimension: table and data survive.
    store.ensure_store(&index, 3).await.unwrap();
    let hits = store.ann_search(&index, &[1.0, 0.0, 0.0], 10).await.unwrap();
    assert_eq!(hits.len(), 1);

    // New dimension: table is dropped and recreated empty.
    store.ensure_store(&index, 4).await.unwrap();
    let hits = store
        .ann_search(&index, &[1.0, 0.0, 0.0, 0.0], 10)
        .await
        .unwrap();
    assert!(hits.is_empty());

    store.drop_index(&index).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn upsert_is_idempotent_by_url() {
    let store = test_store().await;
    let index = unique_index("upsert");
    store.ensure_store(&index, 3).await.unwrap();

    let first = chunk("https://x.test/page#abc", "version one", vec![1.0, 0.0, 0.0]);
    store.upsert_chunk(&index, &first).await.unwrap();
    store.upsert_chunk(&index, &first).await.unwrap();

    let updated = chunk("https://x.test/page#abc", "version two", vec![0.0, 1.0, 0.0]);
    store.upsert_chunk(&index, &updated).await.unwrap();

    let hits = store.ann_search(&index, &[0.0, 1.0, 0.0], 10).await.unwrap();
    assert_eq!(hits.len(), 1, "re-ingest must not duplicate rows");
    assert_eq!(hits[0].content, "version two");

    store.drop_index(&index).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn ann_search_orders_by_distance_then_url() {
    let store = test_store().await;
    let index = unique_index("ann");
    store.ensure_store(&index, 3).await.unwrap();

    store
        .upsert_chunk(&index, &chunk("https://x.test/far#1", "far", vec![0.0, 1.0, 0.0]))
        .await
        .unwrap();
    // Two chunks at identical distance: the tie breaks on ascending URL.
    store
        .upsert_chunk(&index, &chunk("https://x.test/b#1", "near b", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();
    store
        .upsert_chunk(&index, &chunk("https://x.test/a#1", "near a", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let hits = store.ann_search(&index, &[1.0, 0.0, 0.0], 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].url, "https://x.test/a#1");
    assert_eq!(hits[1].url, "https://x.test/b#1");
    assert!(hits[0].score > 0.99, "identical vector scores ~1.0");

    store.drop_index(&index).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn job_lifecycle_counters_and_terminal_stickiness() {
    let store = test_store().await;
    let index = unique_index("job");
    let job_id = Uuid::now_v7().to_string();
    let identity = Identity::user("user-1");

    store
        .create_job(NewJob {
            job_id: &job_id,
            index_name: &index,
            source_url: "https://x.test/docs",
            identity: &identity,
            metadata: Some(serde_json::json!({"trigger": "test"})),
        })
        .await
        .unwrap();

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Started);
    assert!(job.completed_at.is_none());

    store
        .update_job(
            &job_id,
            JobUpdate::status(JobStatus::Running).with_progress(JobProgress {
                pages_discovered: 5,
                pages_processed: 5,
                pages_indexed: 4,
                total_chunks: 12,
            }),
        )
        .await
        .unwrap();

    // Counters are monotonic: a stale lower snapshot cannot regress them.
    store
        .update_job(
            &job_id,
            JobUpdate::progress(JobProgress {
                pages_discovered: 3,
                pages_processed: 3,
                pages_indexed: 2,
                total_chunks: 8,
            }),
        )
        .await
        .unwrap();

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.progress.pages_discovered, 5);
    assert_eq!(job.progress.total_chunks, 12);

    let applied = store
        .update_job(&job_id, JobUpdate::status(JobStatus::Completed))
        .await
        .unwrap();
    assert!(applied);

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.duration_seconds.is_some());

    // Terminal stickiness: later writers lose.
    let applied = store
        .update_job(
            &job_id,
            JobUpdate::status(JobStatus::Failed).with_error("late failure", None),
        )
        .await
        .unwrap();
    assert!(!applied);

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());

    let listed = store.list_jobs_by_identity(&identity, 100).await.unwrap();
    assert!(listed.iter().any(|j| j.job_id == job_id));
    assert!(listed.len() <= 50);
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn access_grants_gate_and_expire() {
    let store = test_store().await;
    let index = unique_index("acc");
    let other = unique_index("acc");

    let session = Uuid::now_v7().to_string();
    let user = Identity::user(format!("user-{session}"));

    // No link yet.
    let err = store.session_identity(&session).await.unwrap_err();
    assert!(matches!(err, docdex_shared::DocdexError::NotLinked));

    store.link_session(&session, &user).await.unwrap();
    let linked = store.session_identity(&session).await.unwrap();
    assert_eq!(linked, user);

    // No grant yet.
    assert!(!store.has_access(&user, &index, AccessLevel::Read).await.unwrap());

    store
        .grant_access(&AccessGrant::for_identity(
            &user,
            index.clone(),
            AccessLevel::Write,
            "admin",
        ))
        .await
        .unwrap();

    assert!(store.has_access(&user, &index, AccessLevel::Read).await.unwrap());
    assert!(store.has_access(&user, &index, AccessLevel::Write).await.unwrap());
    assert!(!store.has_access(&user, &index, AccessLevel::Admin).await.unwrap());
    assert!(!store.has_access(&user, &other, AccessLevel::Read).await.unwrap());

    let indexes = store.accessible_indexes(&user).await.unwrap();
    assert!(indexes.contains(&index.to_string()));
    assert!(!indexes.contains(&other.to_string()));

    // An expired grant is not in force.
    store
        .grant_access(
            &AccessGrant::for_identity(&user, other.clone(), AccessLevel::Read, "admin")
                .expiring_at(Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    assert!(!store.has_access(&user, &other, AccessLevel::Read).await.unwrap());

    // Universal grants apply to everyone.
    let universal_index = unique_index("acc");
    store
        .grant_access(&AccessGrant::universal(
            universal_index.clone(),
            AccessLevel::Read,
            "admin",
        ))
        .await
        .unwrap();
    assert!(
        store
            .has_access(&user, &universal_index, AccessLevel::Read)
            .await
            .unwrap()
    );
}

#[tokio::test]
#[ignore = "requires Postgres with pgvector (set DATABASE_URL)"]
async fn team_sessions_do_not_match_user_grants() {
    let store = test_store().await;
    let index = unique_index("team");
    let marker = Uuid::now_v7().to_string();

    let team = Identity::team_with_user(format!("team-{marker}"), format!("user-{marker}"));

    // A user-scope grant for the member's user id must not leak to the
    // team-scoped session.
    store
        .grant_access(&AccessGrant::for_identity(
            &Identity::user(format!("user-{marker}")),
            index.clone(),
            AccessLevel::Admin,
            "admin",
        ))
        .await
        .unwrap();
    assert!(!store.has_access(&team, &index, AccessLevel::Read).await.unwrap());

    store
        .grant_access(&AccessGrant::for_identity(
            &team,
            index.clone(),
            AccessLevel::Read,
            "admin",
        ))
        .await
        .unwrap();
    assert!(store.has_access(&team, &index, AccessLevel::Read).await.unwrap());
}
