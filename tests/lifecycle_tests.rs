use axum::body::Bytes;
use axum::extract::ws::Message;
use serial_test::serial;
use std::path::Path;

mod common;
use common::{TestSetup, TestVisitor};

use peek_server::lifecycle::UploadedFile;
use peek_server::models::{ServerEvent, ViewOutcome};
use peek_server::repositories::{annotation_repository, post_repository, view_repository};
use peek_server::websocket::connection::handle_client_message;
use peek_server::websocket::GroupMembership;

#[tokio::test]
#[serial]
async fn test_repeat_views_count_once() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("secret", 10).await;
    let visitor = TestVisitor::identity("v1");

    for round in 0..4 {
        let outcome = setup
            .state
            .lifecycle
            .process_view(&post.slug, &visitor)
            .await
            .unwrap();
        match outcome {
            ViewOutcome::Counted { post, counted } => {
                assert_eq!(post.current_views, 1);
                assert_eq!(counted, round == 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    let total = view_repository::count_for_post(&setup.pool, post.id)
        .await
        .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
#[serial]
async fn test_either_signal_proves_prior_viewing() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("secret", 10).await;

    // Cookie "abc" plus fingerprint "xyz".
    let first = peek_server::identity::resolve(Some("abc"), Some("xyz"), None);
    // No cookie, same fingerprint.
    let same_fingerprint = peek_server::identity::resolve(None, Some("xyz"), None);
    // Same cookie, spoofed fingerprint.
    let same_cookie = peek_server::identity::resolve(Some("abc"), Some("spoofed"), None);

    for (identity, expect_counted) in [(first, true), (same_fingerprint, false), (same_cookie, false)] {
        match setup
            .state
            .lifecycle
            .process_view(&post.slug, &identity)
            .await
            .unwrap()
        {
            ViewOutcome::Counted { post, counted } => {
                assert_eq!(counted, expect_counted);
                assert_eq!(post.current_views, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}

#[tokio::test]
#[serial]
async fn test_exhaustion_deletes_everything() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("short lived", 3).await;

    // A live annotation that must disappear with the post.
    annotation_repository::add_or_replace(&setup.pool, post.id, "author", "hi", 10.0, 20.0)
        .await
        .unwrap();

    for i in 0..2 {
        let outcome = setup
            .state
            .lifecycle
            .process_view(&post.slug, &TestVisitor::identity(&format!("v{}", i)))
            .await
            .unwrap();
        assert!(matches!(outcome, ViewOutcome::Counted { counted: true, .. }));
    }

    let outcome = setup
        .state
        .lifecycle
        .process_view(&post.slug, &TestVisitor::identity("v-final"))
        .await
        .unwrap();
    match outcome {
        ViewOutcome::Exhausted { post } => {
            assert_eq!(post.current_views, post.view_limit);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }

    assert!(post_repository::get_post_by_slug(&setup.pool, &post.slug)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        view_repository::count_for_post(&setup.pool, post.id)
            .await
            .unwrap(),
        0
    );
    assert!(annotation_repository::list_for_post(&setup.pool, post.id)
        .await
        .unwrap()
        .is_empty());

    // Subsequent views are indistinguishable from a slug that never existed.
    let outcome = setup
        .state
        .lifecycle
        .process_view(&post.slug, &TestVisitor::identity("v-late"))
        .await
        .unwrap();
    assert!(matches!(outcome, ViewOutcome::NotFound));
}

#[tokio::test]
#[serial]
async fn test_exhaustion_deletes_attached_file() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let file = UploadedFile {
        bytes: Bytes::from_static(b"attachment payload"),
        filename: Some("note.txt".to_string()),
        content_type: Some("text/plain".to_string()),
    };
    let post = setup
        .state
        .lifecycle
        .create_post("with attachment".to_string(), 1, Some(file))
        .await
        .unwrap();

    let name = post.file_name.clone().unwrap();
    assert!(name.ends_with(".txt"));
    let path = Path::new(&setup.state.config.upload_dir).join(&name);
    assert!(path.exists());

    let outcome = setup
        .state
        .lifecycle
        .process_view(&post.slug, &TestVisitor::identity("v1"))
        .await
        .unwrap();
    match outcome {
        ViewOutcome::Exhausted { post } => {
            // The final viewer is still served the attachment metadata.
            assert_eq!(post.file_name.as_deref(), Some(name.as_str()));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }

    assert!(!path.exists());
}

#[tokio::test]
#[serial]
async fn test_failed_insert_cleans_up_stored_file() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let upload_dir = Path::new(&setup.state.config.upload_dir).to_path_buf();
    tokio::fs::create_dir_all(&upload_dir).await.unwrap();
    let before = std::fs::read_dir(&upload_dir).unwrap().count();

    // Storage goes away after the file was written; the orphan must not
    // survive the failed insert.
    setup.pool.close().await;

    let file = UploadedFile {
        bytes: Bytes::from_static(b"orphan"),
        filename: Some("orphan.bin".to_string()),
        content_type: None,
    };
    let result = setup
        .state
        .lifecycle
        .create_post("orphaned".to_string(), 3, Some(file))
        .await;
    assert!(matches!(
        result,
        Err(peek_server::error::LifecycleError::Dependency(_))
    ));

    let after = std::fs::read_dir(&upload_dir).unwrap().count();
    assert_eq!(after, before);
}

#[tokio::test]
#[serial]
async fn test_join_after_exhaustion_is_refused() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("gone soon", 1).await;
    assert!(matches!(
        setup
            .state
            .lifecycle
            .process_view(&post.slug, &TestVisitor::identity("v1"))
            .await
            .unwrap(),
        ViewOutcome::Exhausted { .. }
    ));

    // A client that still holds the link tries to subscribe.
    let connection_id = uuid::Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    setup.state.hub.register_connection(connection_id, tx).await;

    let mut joined = std::collections::HashMap::new();
    let frame = format!(
        r#"{{"type":"join","slug":"{}","visitorId":"v2","asCommittedViewer":true}}"#,
        post.slug
    );
    handle_client_message(&setup.state, connection_id, &mut joined, &frame).await;

    assert_eq!(setup.state.hub.group_size(&post.slug).await, 0);
    assert_eq!(setup.state.presence.active_count(&post.slug).await, 0);
    assert!(joined.is_empty());

    match rx.recv().await.unwrap() {
        Message::Text(text) => {
            let event: ServerEvent = serde_json::from_str(&text).unwrap();
            assert_eq!(
                event,
                ServerEvent::Error {
                    message: "Post not found".to_string()
                }
            );
        }
        other => panic!("expected text message, got {:?}", other),
    }
}

#[tokio::test]
#[serial]
async fn test_concurrent_join_and_exhaustion_leave_no_group_behind() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    for round in 0..10 {
        let post = setup.create_test_post("contended join", 1).await;

        let join_state = setup.state.clone();
        let join_slug = post.slug.clone();
        let join = tokio::spawn(async move {
            let connection_id = uuid::Uuid::new_v4();
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            join_state.hub.register_connection(connection_id, tx).await;
            let mut joined = std::collections::HashMap::new();
            let frame = format!(
                r#"{{"type":"join","slug":"{}","visitorId":"joiner","asCommittedViewer":true}}"#,
                join_slug
            );
            handle_client_message(&join_state, connection_id, &mut joined, &frame).await;
            drop(rx);
            connection_id
        });

        let view_state = setup.state.clone();
        let view_slug = post.slug.clone();
        let viewer = TestVisitor::identity(&format!("exhauster-{}", round));
        let view = tokio::spawn(async move {
            view_state
                .lifecycle
                .process_view(&view_slug, &viewer)
                .await
                .unwrap()
        });

        let connection_id = join.await.unwrap();
        assert!(matches!(
            view.await.unwrap(),
            ViewOutcome::Exhausted { .. }
        ));

        // Whichever order the join and the exhausting view land in, nothing
        // may linger in the dead group or the presence set.
        assert_eq!(
            setup.state.hub.group_size(&post.slug).await,
            0,
            "round {}",
            round
        );
        assert_eq!(setup.state.presence.active_count(&post.slug).await, 0);

        setup.state.hub.remove_connection(connection_id).await;
        setup.state.presence.leave_all(connection_id).await;
    }
}

#[tokio::test]
#[serial]
async fn test_exhaustion_closes_the_realtime_group() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("watched", 1).await;

    let connection_id = uuid::Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    setup.state.hub.register_connection(connection_id, tx).await;
    setup
        .state
        .hub
        .join_group(connection_id, &post.slug, GroupMembership::CommittedViewer)
        .await;
    setup.state.presence.join(connection_id, &post.slug, "v1").await;

    let outcome = setup
        .state
        .lifecycle
        .process_view(&post.slug, &TestVisitor::identity("v1"))
        .await
        .unwrap();
    assert!(matches!(outcome, ViewOutcome::Exhausted { .. }));

    // No view-count update for the exhausting view, and the group is gone.
    assert!(rx.try_recv().is_err());
    assert_eq!(setup.state.hub.group_size(&post.slug).await, 0);
    assert_eq!(setup.state.presence.active_count(&post.slug).await, 0);
}

#[tokio::test]
#[serial]
async fn test_concurrent_views_never_exceed_budget() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let view_limit = 5;
    let post = setup.create_test_post("contended", view_limit).await;

    let mut handles = Vec::new();
    for i in 0..(view_limit + 5) {
        let lifecycle = setup.state.lifecycle.clone();
        let slug = post.slug.clone();
        handles.push(tokio::spawn(async move {
            lifecycle
                .process_view(&slug, &TestVisitor::identity(&format!("c{}", i)))
                .await
                .unwrap()
        }));
    }

    let mut counted = 0;
    let mut exhausted = 0;
    let mut not_found = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ViewOutcome::Counted { post, counted: true } => {
                assert!(post.current_views < post.view_limit);
                counted += 1;
            }
            ViewOutcome::Counted { counted: false, .. } => {
                panic!("distinct identities must never dedup against each other")
            }
            ViewOutcome::Exhausted { post } => {
                assert_eq!(post.current_views, post.view_limit);
                exhausted += 1;
            }
            ViewOutcome::NotFound => not_found += 1,
        }
    }

    // Exactly one view wins the final increment; late arrivals find the post
    // gone.
    assert_eq!(exhausted, 1);
    assert_eq!(counted, (view_limit - 1) as usize);
    assert_eq!(not_found, 5);

    assert!(post_repository::get_post_by_slug(&setup.pool, &post.slug)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        view_repository::count_for_post(&setup.pool, post.id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
#[serial]
async fn test_concurrent_views_below_budget_all_count() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("roomy", 100).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let lifecycle = setup.state.lifecycle.clone();
        let slug = post.slug.clone();
        handles.push(tokio::spawn(async move {
            lifecycle
                .process_view(&slug, &TestVisitor::identity(&format!("n{}", i)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            ViewOutcome::Counted { counted: true, .. }
        ));
    }

    let refreshed = post_repository::get_post_by_slug(&setup.pool, &post.slug)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.current_views, 20);
    assert_eq!(
        view_repository::count_for_post(&setup.pool, post.id)
            .await
            .unwrap(),
        20
    );
}

#[tokio::test]
#[serial]
async fn test_annotation_replaces_previous_from_same_author() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("annotated", 10).await;

    annotation_repository::add_or_replace(&setup.pool, post.id, "author-f", "first", 10.0, 10.0)
        .await
        .unwrap();
    annotation_repository::add_or_replace(&setup.pool, post.id, "author-f", "second", 55.0, 60.0)
        .await
        .unwrap();
    annotation_repository::add_or_replace(&setup.pool, post.id, "author-g", "other", 5.0, 5.0)
        .await
        .unwrap();

    let annotations = annotation_repository::list_for_post(&setup.pool, post.id)
        .await
        .unwrap();
    assert_eq!(annotations.len(), 2);

    let by_f: Vec<_> = annotations
        .iter()
        .filter(|a| a.author_fingerprint == "author-f")
        .collect();
    assert_eq!(by_f.len(), 1);
    assert_eq!(by_f[0].text, "second");
    assert_eq!(by_f[0].position_x, 55.0);
    assert_eq!(by_f[0].position_y, 60.0);
}

#[tokio::test]
#[serial]
async fn test_create_post_validation() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    for (content, view_limit) in [("", 5), ("   ", 5), ("ok", 0), ("ok", -1), ("ok", 101)] {
        let result = setup
            .state
            .lifecycle
            .create_post(content.to_string(), view_limit, None)
            .await;
        assert!(
            matches!(result, Err(peek_server::error::LifecycleError::Validation(_))),
            "content={:?} view_limit={} should be rejected",
            content,
            view_limit
        );
    }
}

#[tokio::test]
#[serial]
async fn test_full_scenario() {
    let setup = TestSetup::new().await;
    setup.cleanup().await;

    let post = setup.create_test_post("hello", 2).await;
    assert_eq!(post.current_views, 0);

    let v1 = TestVisitor::identity("v1");
    match setup
        .state
        .lifecycle
        .process_view(&post.slug, &v1)
        .await
        .unwrap()
    {
        ViewOutcome::Counted { post, counted: true } => {
            assert_eq!(post.current_views, 1);
            assert_eq!(post.view_limit, 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    match setup
        .state
        .lifecycle
        .process_view(&post.slug, &v1)
        .await
        .unwrap()
    {
        ViewOutcome::Counted { post, counted: false } => {
            assert_eq!(post.current_views, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let v2 = TestVisitor::identity("v2");
    assert!(matches!(
        setup
            .state
            .lifecycle
            .process_view(&post.slug, &v2)
            .await
            .unwrap(),
        ViewOutcome::Exhausted { .. }
    ));

    assert!(post_repository::get_post_by_slug(&setup.pool, &post.slug)
        .await
        .unwrap()
        .is_none());
}
