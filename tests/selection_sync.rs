mod common;

use std::time::Duration;

use tokio::time::Instant;

use oras_inspect::gateway::Operation;
use oras_inspect::selection::{Origin, SelectionChanged};
use oras_inspect::SourceKind;

use common::{assert_quiet, next, settle, Fixture};

async fn loaded(tag: &str) -> Fixture {
    let f = Fixture::new();
    let mut completed = f.coordinator.notifications().on_load_completed();
    f.coordinator
        .request_load(&f.reference(tag), SourceKind::ReferenceBox, false)
        .unwrap();
    next(&mut completed).await;
    f
}

fn tag_fetches(f: &Fixture, tag: &str) -> usize {
    f.registry
        .calls()
        .iter()
        .filter(|call| call.operation == Operation::ManifestByTag && call.target == tag)
        .count()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_synchronizer_changes_do_not_reload() {
    let f = Fixture::new();
    let mut changes = f.coordinator.notifications().on_selection_changed();
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator
        .request_load(&f.reference("v1"), SourceKind::ReferenceBox, false)
        .unwrap();
    next(&mut completed).await;

    assert_eq!(
        next(&mut changes).await,
        SelectionChanged::Repository {
            name: Some("demo/app".to_string()),
            origin: Origin::Synchronizer
        }
    );
    assert_eq!(
        next(&mut changes).await,
        SelectionChanged::Tag {
            name: Some("v1".to_string()),
            origin: Origin::Synchronizer
        }
    );

    settle().await;
    assert_eq!(f.registry.call_count(Operation::ManifestByTag), 1);
    assert_quiet(&mut completed);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_tag_selection_is_debounced() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.select_tag("v2").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.coordinator.select_tag("v3").unwrap();
    let selected_at = Instant::now();

    let event = next(&mut completed).await;
    assert_eq!(event.source, SourceKind::TagSelection);
    assert_eq!(event.identity.manifest_digest, f.v3);
    assert!(selected_at.elapsed() >= Duration::from_millis(500));

    settle().await;
    assert_eq!(tag_fetches(&f, "v2"), 0);
    assert_quiet(&mut completed);
    assert_eq!(f.coordinator.selection().selected_tag.as_deref(), Some("v3"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_commit_skips_quiet_period() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.select_tag("v2").unwrap();
    f.coordinator.commit_selection().unwrap();
    let committed_at = Instant::now();

    let event = next(&mut completed).await;
    assert_eq!(event.identity.manifest_digest, f.v2);
    assert!(committed_at.elapsed() < Duration::from_millis(500));

    settle().await;
    assert_eq!(tag_fetches(&f, "v2"), 1);
    assert_quiet(&mut completed);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_other_request_cancels_pending_selection() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.select_tag("v2").unwrap();
    f.coordinator
        .request_load(&f.reference("v3"), SourceKind::ReferenceBox, false)
        .unwrap();

    assert_eq!(next(&mut completed).await.identity.manifest_digest, f.v3);
    settle().await;
    assert_eq!(tag_fetches(&f, "v2"), 0);
    assert_quiet(&mut completed);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_pending_selection_supersedes_running_fetch() {
    let f = loaded("v1").await;
    f.registry.set_delay("v2", Duration::from_millis(200));
    let mut completed = f.coordinator.notifications().on_load_completed();
    let mut failed = f.coordinator.notifications().on_load_failed();

    let slow = f
        .coordinator
        .request_load(&f.reference("v2"), SourceKind::ReferenceBox, false)
        .unwrap();
    f.coordinator.select_tag("v3").unwrap();

    let event = next(&mut completed).await;
    assert!(event.request_id > slow);
    assert_eq!(event.reference, f.reference("v3"));
    assert_eq!(event.source, SourceKind::TagSelection);

    settle().await;
    assert_quiet(&mut completed);
    assert_quiet(&mut failed);
    assert_eq!(tag_fetches(&f, "v2"), 1);
    assert_eq!(f.coordinator.current_identity().manifest_digest, f.v3);
    assert_eq!(
        f.coordinator.history(),
        vec![f.reference("v3"), f.reference("v1")]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_suppressed_selection_does_not_load() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.suppress_next_auto_load().unwrap();
    f.coordinator.select_tag("v2").unwrap();
    settle().await;

    assert_eq!(tag_fetches(&f, "v2"), 0);
    assert_eq!(f.coordinator.selection().selected_tag.as_deref(), Some("v2"));
    assert_eq!(f.coordinator.current_identity().manifest_digest, f.v1);

    // Suppression is one-shot
    f.coordinator.select_tag("v3").unwrap();
    assert_eq!(next(&mut completed).await.identity.manifest_digest, f.v3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_commit_loads_suppressed_selection() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.suppress_next_auto_load().unwrap();
    f.coordinator.select_tag("v2").unwrap();
    f.coordinator.commit_selection().unwrap();

    let event = next(&mut completed).await;
    assert_eq!(event.identity.manifest_digest, f.v2);
    assert_eq!(event.source, SourceKind::CoordinatorNavigation);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_digest_load_clears_unmatched_tag() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator
        .request_load(&f.digest_reference(&f.v2), SourceKind::DigestClick, false)
        .unwrap();
    let event = next(&mut completed).await;

    assert_eq!(event.identity.manifest_digest, f.v2);
    assert_eq!(event.identity.selected_tag_name, None);
    assert_eq!(f.coordinator.selection().selected_tag, None);
    assert_eq!(tag_fetches(&f, "v2"), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_digest_click_on_displayed_manifest_is_recorded() {
    let f = loaded("v1").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator
        .request_load(&f.digest_reference(&f.v1), SourceKind::DigestClick, false)
        .unwrap();
    let event = next(&mut completed).await;
    assert_eq!(event.identity.manifest_digest, f.v1);
    assert_eq!(event.identity.selected_tag_name, None);
    assert_eq!(
        f.coordinator.history(),
        vec![f.digest_reference(&f.v1), f.reference("v1")]
    );

    // Now the digest form is what's displayed
    f.coordinator
        .request_load(&f.digest_reference(&f.v1), SourceKind::DigestClick, false)
        .unwrap();
    settle().await;
    assert_quiet(&mut completed);
    assert_eq!(f.registry.call_count(Operation::ManifestByDigest), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_digest_load_selects_known_tag() {
    let f = loaded("v2").await;
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator
        .request_load(&f.reference("v1"), SourceKind::ReferenceBox, false)
        .unwrap();
    next(&mut completed).await;
    f.coordinator
        .request_load(&f.digest_reference(&f.v2), SourceKind::DigestClick, false)
        .unwrap();
    next(&mut completed).await;

    assert_eq!(f.coordinator.selection().selected_tag.as_deref(), Some("v2"));
    assert_eq!(f.coordinator.current_identity().selected_tag_name, None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_select_repository_lists_its_tags() {
    let f = loaded("v1").await;
    let mut changes = f.coordinator.notifications().on_selection_changed();
    let mut completed = f.coordinator.notifications().on_load_completed();

    f.coordinator.select_repository("demo/other").unwrap();

    assert_eq!(
        next(&mut changes).await,
        SelectionChanged::Repository {
            name: Some("demo/other".to_string()),
            origin: Origin::User
        }
    );
    assert_eq!(
        next(&mut changes).await,
        SelectionChanged::Tag {
            name: None,
            origin: Origin::Synchronizer
        }
    );

    let selection = f.coordinator.selection();
    assert_eq!(selection.tags_repository.as_deref(), Some("demo/other"));
    let names: Vec<_> = selection.tags.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["latest"]);

    f.coordinator.select_tag("latest").unwrap();
    let event = next(&mut completed).await;
    assert_eq!(event.reference, "example.com/demo/other:latest");
    assert_eq!(event.identity.manifest_digest, f.other);
}
