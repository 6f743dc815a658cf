//! Dataset lifecycle: content-addressed registration and cascade
//! deletion of dataset-scoped vector notes.

mod common;

use common::fixture;
use datalyst_runtime::vector::{NoteContentType, NoteScope};
use datalyst_runtime::DatasetUpload;

#[tokio::test]
async fn reupload_returns_the_same_dataset() {
    let fx = fixture(vec!["ok".to_string()]).await;
    let again = fx
        .runtime
        .datasets
        .register(
            fx.user,
            DatasetUpload {
                name: "renamed",
                origin_format: "csv",
                payload: b"age,city\n34,berlin\n49,lagos\n",
                row_count: 200,
                columns: fx.dataset.columns.clone(),
            },
        )
        .await
        .expect("register");
    assert_eq!(again.id, fx.dataset.id);
}

#[tokio::test]
async fn deleting_a_dataset_cascades_to_its_notes() {
    let fx = fixture(vec!["ok".to_string()]).await;

    let note = fx
        .runtime
        .notes
        .create_note(
            fx.user,
            NoteScope::Dataset,
            Some(fx.dataset.id),
            NoteContentType::Insight,
            "age skew",
            "age distribution is right-skewed",
            0.9,
        )
        .await
        .expect("note");
    let global = fx
        .runtime
        .notes
        .create_note(
            fx.user,
            NoteScope::Global,
            None,
            NoteContentType::Insight,
            "general",
            "prefer robust statistics",
            0.9,
        )
        .await
        .expect("global note");

    assert!(fx
        .runtime
        .delete_dataset(fx.user, fx.dataset.id)
        .await
        .expect("delete"));

    // The dataset-scoped note is gone; the global one survives.
    let scoped = fx
        .runtime
        .notes
        .search_text(
            "age distribution is right-skewed",
            NoteScope::Dataset,
            Some(fx.dataset.id),
            Some(fx.user),
            5,
            0.5,
        )
        .await
        .expect("search");
    assert!(scoped.iter().all(|h| h.note.id != note.id));

    let kept = fx
        .runtime
        .notes
        .search_text(
            "prefer robust statistics",
            NoteScope::Global,
            None,
            Some(fx.user),
            5,
            0.9,
        )
        .await
        .expect("search");
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].note.id, global.id);
}
