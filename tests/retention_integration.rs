//! End-to-end scenarios for the create/delete state machine and the
//! retention engine, driven against an in-memory store and a scripted
//! workflow engine.

mod common;

use cairn::coordinator::TriggerOutcome;
use cairn::model::{MaterializedStatus, TagLevel};
use chrono::{DateTime, TimeZone, Utc};
use common::{spec_daily, test_engine};

fn jan(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, h, m, s).unwrap()
}

#[tokio::test]
async fn first_backup_is_fully_tagged_and_never_elected() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();

    let outcome = engine.trigger_new_backup("a").await.unwrap();
    let TriggerOutcome::Launched(workflow_id) = outcome else {
        panic!("expected a launched workflow, got {:?}", outcome);
    };
    let spec = store.get_spec("a").await.unwrap();
    assert_eq!(spec.running_create_workflow.as_deref(), Some(workflow_id.as_str()));

    workflows.complete_create(&workflow_id, "d1", 10.0, jan(1, 0, 0, 0), jan(1, 0, 0, 5));
    engine.check_create("a").await;

    let spec = store.get_spec("a").await.unwrap();
    assert_eq!(spec.running_create_workflow, None);

    let mb = store.get_materialized(&workflow_id).await.unwrap();
    assert_eq!(mb.status, MaterializedStatus::Completed);
    assert_eq!(mb.data_id.as_deref(), Some("d1"));
    assert_eq!(mb.size_mb, 10.0);
    for level in TagLevel::ALL {
        assert!(mb.tagged(level), "expected {} tag on the fresh backup", level);
    }
    assert!(mb.reference);

    // the only backup survives a full retention pass untouched
    engine.run_retention_task("a").await;
    assert!(workflows.delete_calls().is_empty());
    let mb = store.get_materialized(&workflow_id).await.unwrap();
    assert_eq!(mb.status, MaterializedStatus::Completed);
}

#[tokio::test]
async fn daily_retention_elects_the_three_oldest() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();

    // five completed backups on five consecutive days (one ISO week)
    for day in 1..=5u32 {
        store
            .create_materialized(
                &format!("b{}", day),
                "a",
                &format!("data-{}", day),
                MaterializedStatus::Completed,
                jan(day, 0, 0, 0),
                jan(day, 0, 0, 5),
                10.0,
            )
            .await
            .unwrap();
    }

    engine.run_retention_task("a").await;

    let deletes = workflows.delete_calls();
    assert_eq!(deletes.len(), 3);
    let deleted_data: Vec<&str> = deletes.iter().map(|(_, d)| d.as_str()).collect();
    assert_eq!(deleted_data, ["data-1", "data-2", "data-3"]);

    for day in 1..=3u32 {
        let mb = store.get_materialized(&format!("b{}", day)).await.unwrap();
        assert_eq!(mb.status, MaterializedStatus::Deleting);
        assert!(mb.running_delete_workflow.is_some());
    }
    for day in 4..=5u32 {
        let mb = store.get_materialized(&format!("b{}", day)).await.unwrap();
        assert_eq!(mb.status, MaterializedStatus::Completed);
    }

    // a second pass re-tags the two survivors and elects nothing new
    engine.run_retention_task("a").await;
    assert_eq!(workflows.delete_calls().len(), 3);
    let survivors = store
        .list_materialized("a", 10, None, Some(MaterializedStatus::Completed), false)
        .await
        .unwrap();
    assert_eq!(survivors.len(), 2);
    assert!(survivors.iter().all(|mb| mb.daily));
}

#[tokio::test]
async fn no_second_create_while_workflow_runs() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();

    let TriggerOutcome::Launched(_) = engine.trigger_new_backup("a").await.unwrap() else {
        panic!("first trigger should launch");
    };

    // the workflow is still RUNNING: the second trigger is a skip, not an error
    match engine.trigger_new_backup("a").await.unwrap() {
        TriggerOutcome::Skipped(_) => {}
        other => panic!("expected a skip, got {:?}", other),
    }
    assert_eq!(workflows.create_calls().len(), 1);
}

#[tokio::test]
async fn vanished_workflow_is_cleared_and_relaunched() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();

    let TriggerOutcome::Launched(workflow_id) = engine.trigger_new_backup("a").await.unwrap()
    else {
        panic!("expected launch");
    };
    workflows.forget(&workflow_id);

    // next tick: the id is cleared and no materialized backup appears
    engine.check_create("a").await;
    let spec = store.get_spec("a").await.unwrap();
    assert_eq!(spec.running_create_workflow, None);
    assert!(store.get_materialized(&workflow_id).await.is_err());

    // and the following trigger launches anew
    let TriggerOutcome::Launched(new_id) = engine.trigger_new_backup("a").await.unwrap() else {
        panic!("expected relaunch");
    };
    assert_ne!(new_id, workflow_id);
    assert_eq!(workflows.create_calls().len(), 2);
}

#[tokio::test]
async fn failed_create_clears_id_without_materializing() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();

    let TriggerOutcome::Launched(workflow_id) = engine.trigger_new_backup("a").await.unwrap()
    else {
        panic!("expected launch");
    };
    workflows.finish(&workflow_id, cairn::conductor::WorkflowStatus::Failed);

    engine.check_create("a").await;
    let spec = store.get_spec("a").await.unwrap();
    assert_eq!(spec.running_create_workflow, None);
    assert!(store.get_materialized(&workflow_id).await.is_err());
}

#[tokio::test]
async fn delete_workflow_lookup_failure_relaunches() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();
    store
        .create_materialized(
            "b1",
            "a",
            "data-1",
            MaterializedStatus::Completed,
            jan(1, 0, 0, 0),
            jan(1, 0, 0, 5),
            10.0,
        )
        .await
        .unwrap();

    engine.trigger_backup_delete("b1").await.unwrap();
    let mb = store.get_materialized("b1").await.unwrap();
    assert_eq!(mb.status, MaterializedStatus::Deleting);
    let first_delete = mb.running_delete_workflow.clone().unwrap();

    workflows.fail_lookup(&first_delete);
    engine.check_deletes("a").await;

    // a replacement workflow was launched and persisted; status unchanged
    let mb = store.get_materialized("b1").await.unwrap();
    assert_eq!(mb.status, MaterializedStatus::Deleting);
    let second_delete = mb.running_delete_workflow.clone().unwrap();
    assert_ne!(second_delete, first_delete);
    assert_eq!(workflows.delete_calls().len(), 2);
}

#[tokio::test]
async fn delete_transitions_follow_workflow_terminals() {
    let (engine, store, workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();
    for (id, data) in [("b1", "data-1"), ("b2", "data-2")] {
        store
            .create_materialized(
                id,
                "a",
                data,
                MaterializedStatus::Completed,
                jan(1, 0, 0, 0),
                jan(1, 0, 0, 5),
                10.0,
            )
            .await
            .unwrap();
    }

    engine.trigger_backup_delete("b1").await.unwrap();
    engine.trigger_backup_delete("b2").await.unwrap();
    let wf1 = store
        .get_materialized("b1")
        .await
        .unwrap()
        .running_delete_workflow
        .unwrap();
    let wf2 = store
        .get_materialized("b2")
        .await
        .unwrap()
        .running_delete_workflow
        .unwrap();

    workflows.finish(&wf1, cairn::conductor::WorkflowStatus::Completed);
    workflows.finish(&wf2, cairn::conductor::WorkflowStatus::Failed);
    engine.check_deletes("a").await;

    let done = store.get_materialized("b1").await.unwrap();
    assert_eq!(done.status, MaterializedStatus::Deleted);
    assert_eq!(done.running_delete_workflow, None);

    // terminal-but-not-completed: delete-error, workflow id preserved
    let failed = store.get_materialized("b2").await.unwrap();
    assert_eq!(failed.status, MaterializedStatus::DeleteError);
    assert_eq!(failed.running_delete_workflow.as_deref(), Some(wf2.as_str()));
}

#[tokio::test]
async fn trigger_delete_refuses_bad_states() {
    let (engine, store, _workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();
    store
        .create_materialized(
            "b1",
            "a",
            "data-1",
            MaterializedStatus::Completed,
            jan(1, 0, 0, 0),
            jan(1, 0, 0, 5),
            10.0,
        )
        .await
        .unwrap();

    engine.trigger_backup_delete("b1").await.unwrap();
    // a delete is already in flight
    assert!(engine.trigger_backup_delete("b1").await.is_err());

    store
        .set_materialized_status("b1", MaterializedStatus::Deleted, None)
        .await
        .unwrap();
    // and deleted rows can never be re-deleted
    assert!(engine.trigger_backup_delete("b1").await.is_err());
}

#[tokio::test]
async fn tagging_is_idempotent() {
    let (engine, store, _workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();
    for day in 1..=4u32 {
        store
            .create_materialized(
                &format!("b{}", day),
                "a",
                &format!("data-{}", day),
                MaterializedStatus::Completed,
                jan(day, 6, 30, 0),
                jan(day, 6, 30, 10),
                5.0,
            )
            .await
            .unwrap();
    }

    engine.tag_all_backups("a").await.unwrap();
    let first: Vec<_> = store
        .list_materialized("a", 10, None, None, true)
        .await
        .unwrap()
        .into_iter()
        .map(|mb| {
            (
                mb.id,
                mb.minutely,
                mb.hourly,
                mb.daily,
                mb.weekly,
                mb.monthly,
                mb.yearly,
                mb.reference,
            )
        })
        .collect();

    engine.tag_all_backups("a").await.unwrap();
    let second: Vec<_> = store
        .list_materialized("a", 10, None, None, true)
        .await
        .unwrap()
        .into_iter()
        .map(|mb| {
            (
                mb.id,
                mb.minutely,
                mb.hourly,
                mb.daily,
                mb.weekly,
                mb.monthly,
                mb.yearly,
                mb.reference,
            )
        })
        .collect();

    assert_eq!(first, second);
}

#[tokio::test]
async fn parent_containment_holds_after_tagging() {
    let (engine, store, _workflows) = test_engine();
    store.create_spec(spec_daily("a", "4@L")).await.unwrap();

    // a spread of backups: several per day, across weeks and months
    let times = [
        jan(1, 0, 10, 0),
        jan(1, 0, 10, 30),
        jan(1, 8, 0, 0),
        jan(2, 0, 0, 0),
        jan(9, 12, 0, 0),
        jan(31, 23, 0, 0),
        Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 15, 1, 0, 0).unwrap(),
    ];
    for (i, end) in times.iter().enumerate() {
        store
            .create_materialized(
                &format!("b{}", i),
                "a",
                &format!("data-{}", i),
                MaterializedStatus::Completed,
                *end - chrono::Duration::seconds(10),
                *end,
                1.0,
            )
            .await
            .unwrap();
    }

    engine.tag_all_backups("a").await.unwrap();

    let all = store.list_materialized("a", 50, None, None, true).await.unwrap();
    assert_eq!(all.len(), times.len());
    for mb in &all {
        if mb.hourly {
            assert!(mb.minutely, "{}: hourly requires minutely", mb.id);
        }
        if mb.daily {
            assert!(mb.hourly, "{}: daily requires hourly", mb.id);
        }
        if mb.weekly {
            assert!(mb.daily, "{}: weekly requires daily", mb.id);
        }
        if mb.monthly {
            assert!(mb.daily, "{}: monthly requires daily", mb.id);
        }
        if mb.yearly {
            assert!(mb.monthly, "{}: yearly requires monthly", mb.id);
        }
    }

    // the freshest completed backup carries every tag
    let newest = &store
        .list_materialized("a", 1, None, Some(MaterializedStatus::Completed), false)
        .await
        .unwrap()[0];
    for level in TagLevel::ALL {
        assert!(newest.tagged(level));
    }
}

#[tokio::test]
async fn tagging_with_no_completed_backups_is_a_noop() {
    let (engine, store, _workflows) = test_engine();
    store.create_spec(spec_daily("a", "2@L")).await.unwrap();
    engine.tag_all_backups("a").await.unwrap();

    store
        .create_materialized(
            "b1",
            "a",
            "data-1",
            MaterializedStatus::Deleting,
            jan(1, 0, 0, 0),
            jan(1, 0, 0, 5),
            1.0,
        )
        .await
        .unwrap();
    engine.tag_all_backups("a").await.unwrap();
    let mb = store.get_materialized("b1").await.unwrap();
    assert!(!mb.minutely && !mb.reference);
}
