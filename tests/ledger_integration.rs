//! End-to-end tests over an on-disk SQLite ledger
//!
//! Each test opens a fresh database in a temporary directory and drives
//! the services the way the publish and evaluation pipelines do.

use courseware_ledger::services::AttemptRequest;
use courseware_ledger::{
    ChangeId, Config, CoursewareNode, ElementType, LedgerEvent, PublishRequest, Score, ScoreReason, Services,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Helper to open services over a temporary storage directory
fn open_services() -> (Services, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        pool_size: 2,
        ..Config::default()
    };
    config.retry.base_delay_ms = 0;
    let services = Services::open(&config).unwrap();
    (services, temp_dir)
}

struct Course {
    activity: Uuid,
    pathway: Uuid,
    interactives: Vec<Uuid>,
    request: PublishRequest,
}

/// Activity -> pathway -> interactives, plus a component on the activity
fn course(interactives: usize, change_id: ChangeId) -> Course {
    let activity = Uuid::new_v4();
    let pathway = Uuid::new_v4();
    let interactive_ids: Vec<Uuid> = (0..interactives).map(|_| Uuid::new_v4()).collect();

    let mut pathway_node = CoursewareNode::new(pathway, ElementType::Pathway);
    for id in &interactive_ids {
        pathway_node = pathway_node.with_child(
            CoursewareNode::new(*id, ElementType::Interactive)
                .with_child(CoursewareNode::new(Uuid::new_v4(), ElementType::Feedback)),
        );
    }
    let root = CoursewareNode::new(activity, ElementType::Activity)
        .with_config(r#"{"title":"Fractions"}"#)
        .with_child(pathway_node)
        .with_child(CoursewareNode::new(Uuid::new_v4(), ElementType::Component));

    Course {
        activity,
        pathway,
        interactives: interactive_ids,
        request: PublishRequest {
            deployment_id: Uuid::new_v4(),
            cohort_id: Uuid::new_v4(),
            change_id,
            root,
        },
    }
}

fn attempt_request(course: &Course, student_id: Uuid, element_id: Uuid, parent: Option<Uuid>) -> AttemptRequest {
    let element_type = if element_id == course.activity {
        ElementType::Activity
    } else {
        ElementType::Interactive
    };
    AttemptRequest {
        deployment_id: course.request.deployment_id,
        student_id,
        element_id,
        element_type,
        parent_attempt_id: parent,
    }
}

#[tokio::test]
async fn test_completed_interaction_rolls_up_to_activity() {
    let (services, _temp) = open_services();
    let mut events = services.events.subscribe();
    let course = course(1, ChangeId::new());
    let student = Uuid::new_v4();

    let change_id = services.publish(&course.request).await.unwrap();
    assert_eq!(change_id, course.request.change_id);

    let published = timeout(Duration::from_millis(100), events.recv()).await.unwrap().unwrap();
    assert!(matches!(published, LedgerEvent::DeploymentPublished { .. }));

    let pin = services.versions.require_pin(course.request.deployment_id).await.unwrap();
    let activity_attempt = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.activity, None))
        .await
        .unwrap();
    let interactive_attempt = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.interactives[0], Some(activity_attempt.id)))
        .await
        .unwrap();
    assert_eq!(interactive_attempt.value, 1);

    let outcome = services
        .progress
        .evaluate_interaction(pin, interactive_attempt.id, None, Score::scored(1.0))
        .await
        .unwrap();

    assert_eq!(outcome.leaf.completion_value, Some(1.0));
    assert_eq!(outcome.rollups.len(), 2);

    let pathway = services
        .progress
        .find_progress(course.pathway, activity_attempt.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pathway.completion_value, Some(1.0));
    assert_eq!(pathway.child_completion_values, Some(vec![1.0]));

    let activity = services
        .progress
        .find_latest_progress(student, course.activity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(activity.completion_value, Some(1.0));
    assert_eq!(activity.score.map(|s| s.reason), Some(ScoreReason::Scored));

    // Interactive and activity both completed
    assert_eq!(outcome.completed.len(), 2);
    let under_activity = services
        .progress
        .find_completed_by_parent(student, course.activity, activity_attempt.id)
        .await
        .unwrap();
    assert_eq!(under_activity.len(), 1);
    assert_eq!(under_activity[0].element_id, course.interactives[0]);
    assert_eq!(under_activity[0].parent_element_type, Some(ElementType::Activity));
}

#[tokio::test]
async fn test_unattempted_sibling_weighs_on_confidence_only() {
    let (services, _temp) = open_services();
    let course = course(2, ChangeId::new());
    let student = Uuid::new_v4();
    services.publish(&course.request).await.unwrap();
    let pin = services.versions.require_pin(course.request.deployment_id).await.unwrap();

    let activity_attempt = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.activity, None))
        .await
        .unwrap();
    let first = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.interactives[0], Some(activity_attempt.id)))
        .await
        .unwrap();

    let outcome = services
        .progress
        .evaluate_interaction(pin, first.id, None, Score::scored(0.5))
        .await
        .unwrap();

    let pathway = &outcome.rollups[0];
    assert_eq!(pathway.element_id, course.pathway);
    assert_eq!(pathway.completion_value, Some(0.5));
    assert_eq!(pathway.completion_confidence, 0.5);
    assert_eq!(pathway.child_completion_confidences, Some(vec![1.0, 0.0]));
    assert_eq!(pathway.score.map(|s| s.reason), Some(ScoreReason::IncompleteAttempt));

    let activity = &outcome.rollups[1];
    assert_eq!(activity.completion_value, Some(0.5));
    assert!(outcome.completed.is_empty());
}

#[tokio::test]
async fn test_reevaluating_same_interaction_is_idempotent() {
    let (services, _temp) = open_services();
    let course = course(1, ChangeId::new());
    let student = Uuid::new_v4();
    services.publish(&course.request).await.unwrap();
    let pin = services.versions.require_pin(course.request.deployment_id).await.unwrap();

    let activity_attempt = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.activity, None))
        .await
        .unwrap();
    let attempt = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.interactives[0], Some(activity_attempt.id)))
        .await
        .unwrap();

    let evaluation = Some(Uuid::new_v4());
    let first = services
        .progress
        .evaluate_interaction(pin, attempt.id, evaluation, Score::scored(1.0))
        .await
        .unwrap();
    let second = services
        .progress
        .evaluate_interaction(pin, attempt.id, evaluation, Score::scored(1.0))
        .await
        .unwrap();
    assert_eq!(first, second);

    let completions = services
        .progress
        .find_completed_by_element(student, course.interactives[0])
        .await
        .unwrap();
    assert_eq!(completions.len(), 1);

    let rows = services
        .progress
        .find_student_progress(course.request.deployment_id, student)
        .await
        .unwrap();
    // interactive, pathway, activity
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_latest_change_is_maximum_across_publishes() {
    let (services, _temp) = open_services();
    let base = course(1, ChangeId::from_unix(1_700_000_000, 0, 0));
    let deployment_id = base.request.deployment_id;

    let newest = ChangeId::from_unix(1_700_000_200, 0, 0);
    let middle = ChangeId::from_unix(1_700_000_100, 0, 0);
    for change_id in [base.request.change_id, newest, middle] {
        let request = PublishRequest {
            change_id,
            ..base.request.clone()
        };
        services.publish(&request).await.unwrap();
    }

    assert_eq!(services.versions.latest_change_id(deployment_id).await.unwrap(), Some(newest));
    assert_eq!(
        services.versions.list_changes(deployment_id).await.unwrap(),
        vec![newest, middle, base.request.change_id]
    );

    // Historical snapshots stay readable under their own change
    let old_pin = courseware_ledger::PinnedDeployment::new(deployment_id, base.request.change_id);
    let element = services.tree.find_element(old_pin, base.activity).await.unwrap().unwrap();
    assert_eq!(element.change_id, base.request.change_id);

    let latest = services
        .tree
        .find_latest_element(deployment_id, base.activity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.change_id, newest);
}

#[tokio::test]
async fn test_unpublished_deployment_reads_empty() {
    let (services, _temp) = open_services();
    let deployment_id = Uuid::new_v4();

    assert!(services.versions.latest_change_id(deployment_id).await.unwrap().is_none());
    assert!(services
        .tree
        .find_latest_children(deployment_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
    assert!(services
        .tree
        .find_latest_parent(deployment_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_published_tree_verifies_clean_on_sqlite() {
    let (services, _temp) = open_services();
    let course = course(3, ChangeId::new());
    services.publish(&course.request).await.unwrap();

    // A retried publish appends every child a second time
    services.publish(&course.request).await.unwrap();

    let report = services
        .tree
        .verify(course.request.pin(), course.activity)
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.elements_checked, course.request.root.size());
    assert_eq!(report.duplicate_cells, course.request.root.size() - 1);

    let children = services
        .tree
        .find_children(course.request.pin(), course.pathway)
        .await
        .unwrap();
    assert_eq!(children.ids(), course.interactives);
}

#[tokio::test]
async fn test_scope_store_on_sqlite() {
    let (services, _temp) = open_services();
    let deployment_id = Uuid::new_v4();
    let student = Uuid::new_v4();

    let scope = services
        .scopes
        .find_or_create_scope(deployment_id, student, Uuid::new_v4())
        .await
        .unwrap();
    let source = Uuid::new_v4();
    services
        .scopes
        .write(scope.id, source, student, json!({"answer": 41}))
        .await
        .unwrap();
    let last = services
        .scopes
        .write(scope.id, source, student, json!({"answer": 42}))
        .await
        .unwrap();

    let latest = services.scopes.read_latest(scope.id).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].data, json!({"answer": 42}));
    assert_eq!(services.scopes.read_history(scope.id, source).await.unwrap(), Some(last));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attempts_never_share_an_ordinal() {
    let (services, _temp) = open_services();
    let course = course(1, ChangeId::new());
    services.publish(&course.request).await.unwrap();
    let element = course.interactives[0];

    for _ in 0..8 {
        let student = Uuid::new_v4();
        let first_parent = services
            .attempts
            .new_attempt(attempt_request(&course, student, course.activity, None))
            .await
            .unwrap();
        let second_parent = services
            .attempts
            .new_attempt(attempt_request(&course, student, course.activity, None))
            .await
            .unwrap();

        let (left, right) = tokio::join!(
            services
                .attempts
                .new_attempt(attempt_request(&course, student, element, Some(first_parent.id))),
            services
                .attempts
                .new_attempt(attempt_request(&course, student, element, Some(second_parent.id))),
        );
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_ne!(left.id, right.id);
        assert_ne!(left.value, right.value);
        assert_eq!(left.parent_id, Some(first_parent.id));
        assert_eq!(right.parent_id, Some(second_parent.id));
        for attempt in [left, right] {
            assert_eq!(services.attempts.get_attempt(attempt.id).await.unwrap(), Some(attempt));
        }

        let mut ordinals: Vec<u32> = services
            .attempts
            .find_attempts(student, element)
            .await
            .unwrap()
            .iter()
            .map(|a| a.value)
            .collect();
        ordinals.sort_unstable();
        assert_eq!(ordinals, vec![1, 2]);
    }
}

#[tokio::test]
async fn test_attempt_parent_must_enclose_element() {
    let (services, _temp) = open_services();
    let course = course(2, ChangeId::new());
    services.publish(&course.request).await.unwrap();
    let student = Uuid::new_v4();

    let activity = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.activity, None))
        .await
        .unwrap();
    let sibling = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.interactives[0], Some(activity.id)))
        .await
        .unwrap();

    let result = services
        .attempts
        .new_attempt(attempt_request(&course, student, course.interactives[1], Some(sibling.id)))
        .await;
    assert!(matches!(result, Err(courseware_ledger::StorageError::InvalidInput(_))), "{:?}", result);
}
