//! Scoped retrieval scenarios over the vector store.

use std::sync::Arc;

use datalyst_runtime::config::VectorConfig;
use datalyst_runtime::storage::InMemoryKvStore;
use datalyst_runtime::types::{DatasetId, UserId};
use datalyst_runtime::vector::{NoteContentType, NoteScope, VectorNote, VectorStore};

fn store() -> VectorStore {
    VectorStore::new(Arc::new(InMemoryKvStore::new()), VectorConfig::default())
}

fn basis_vector(dimension: usize, hot: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[hot] = 1.0;
    v
}

fn note(
    owner: UserId,
    scope: NoteScope,
    dataset: Option<DatasetId>,
    title: &str,
) -> VectorNote {
    VectorNote::new(
        owner,
        scope,
        dataset,
        NoteContentType::Insight,
        title,
        title,
        0.9,
    )
}

#[tokio::test]
async fn scoped_search_returns_the_nearest_note_and_bumps_usage() {
    let store = store();
    let owner = UserId::new();
    let dataset = DatasetId::new();
    let dimension = 8;

    let aligned = note(owner, NoteScope::Dataset, Some(dataset), "aligned");
    let orthogonal = note(owner, NoteScope::Dataset, Some(dataset), "orthogonal");
    let global = note(owner, NoteScope::Global, None, "global twin");

    store
        .put(&aligned, basis_vector(dimension, 0))
        .await
        .unwrap();
    store
        .put(&orthogonal, basis_vector(dimension, 1))
        .await
        .unwrap();
    store.put(&global, basis_vector(dimension, 0)).await.unwrap();

    let hits = store
        .search(
            &basis_vector(dimension, 0),
            NoteScope::Dataset,
            Some(dataset),
            Some(owner),
            1,
            0.7,
        )
        .await
        .unwrap();

    // Exactly one result: the dataset-scoped aligned note. The global
    // twin with an identical embedding is invisible in dataset scope.
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id, aligned.id);
    assert!(hits[0].similarity > 0.99);

    // Its usage count was bumped by exactly one.
    let again = store
        .search(
            &basis_vector(dimension, 0),
            NoteScope::Dataset,
            Some(dataset),
            Some(owner),
            1,
            0.7,
        )
        .await
        .unwrap();
    assert_eq!(again[0].note.usage_count, 1);
}

#[tokio::test]
async fn global_search_never_sees_dataset_notes() {
    let store = store();
    let owner = UserId::new();
    let dataset = DatasetId::new();

    let scoped = note(owner, NoteScope::Dataset, Some(dataset), "scoped");
    store.put(&scoped, basis_vector(4, 0)).await.unwrap();

    let hits = store
        .search(&basis_vector(4, 0), NoteScope::Global, None, Some(owner), 10, 0.0)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn threshold_filters_weak_matches() {
    let store = store();
    let owner = UserId::new();
    let dataset = DatasetId::new();

    let weak = note(owner, NoteScope::Dataset, Some(dataset), "weak");
    // 45 degrees from the query: similarity ≈ 0.707.
    let mut embedding = vec![0.0; 4];
    embedding[0] = 1.0;
    embedding[1] = 1.0;
    store.put(&weak, embedding).await.unwrap();

    let strict = store
        .search(&basis_vector(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 5, 0.8)
        .await
        .unwrap();
    assert!(strict.is_empty());

    let loose = store
        .search(&basis_vector(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 5, 0.7)
        .await
        .unwrap();
    assert_eq!(loose.len(), 1);
}

#[tokio::test]
async fn ties_break_toward_the_most_recent_note() {
    let store = store();
    let owner = UserId::new();
    let dataset = DatasetId::new();

    let older = note(owner, NoteScope::Dataset, Some(dataset), "older");
    store.put(&older, basis_vector(4, 0)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = note(owner, NoteScope::Dataset, Some(dataset), "newer");
    store.put(&newer, basis_vector(4, 0)).await.unwrap();

    let hits = store
        .search(&basis_vector(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 1, 0.5)
        .await
        .unwrap();
    assert_eq!(hits[0].note.id, newer.id);
}

#[tokio::test]
async fn top_k_truncates_after_ranking() {
    let store = store();
    let owner = UserId::new();
    let dataset = DatasetId::new();

    for i in 0..5 {
        let n = note(owner, NoteScope::Dataset, Some(dataset), &format!("n{}", i));
        let mut embedding = vec![0.0f32; 4];
        embedding[0] = 1.0;
        embedding[1] = i as f32 * 0.1;
        store.put(&n, embedding).await.unwrap();
    }

    let hits = store
        .search(&basis_vector(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 3, 0.0)
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    // Descending similarity.
    assert!(hits[0].similarity >= hits[1].similarity);
    assert!(hits[1].similarity >= hits[2].similarity);
}
