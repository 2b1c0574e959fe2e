// The confirmation gate, exercised through the public API: a destructive
// plan straight out of the planner must not run a single command without
// a token minted for that exact plan.

mod common;

use blocksmith::planner::{OperationIntent, Planner, RaidLevel};
use blocksmith::reporter::RecordingReporter;
use blocksmith::{ConfirmationToken, DeviceRole, Error, PrivilegedExecutor};
use common::{device, offline_settings, snapshot, GIB};

fn raid_plan() -> blocksmith::Plan {
    let snap = snapshot(vec![
        device("/dev/sdb", 4000 * GIB, DeviceRole::Free),
        device("/dev/sdc", 4000 * GIB, DeviceRole::Free),
    ]);
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
        array_name: "md0".to_string(),
    };
    Planner::new(offline_settings()).plan(&intent, &snap).unwrap()
}

#[tokio::test]
async fn destructive_plan_without_token_invokes_zero_commands() {
    let plan = raid_plan();
    let plan_id = plan.id;
    assert!(plan.is_destructive());

    let mut executor = PrivilegedExecutor::new(offline_settings(), RecordingReporter::new());
    let err = executor.execute(plan, None).await.unwrap_err();

    assert!(matches!(err, Error::ConfirmationMissing(id) if id == plan_id));
    assert!(
        executor.reporter().events.is_empty(),
        "no step may start, no output may stream"
    );
}

#[tokio::test]
async fn token_minted_for_one_plan_does_not_confirm_another() {
    let mut confirmed_elsewhere = raid_plan();
    let stale = ConfirmationToken::approve(&mut confirmed_elsewhere).unwrap();

    let plan = raid_plan();
    let plan_id = plan.id;

    let mut executor = PrivilegedExecutor::new(offline_settings(), RecordingReporter::new());
    let err = executor.execute(plan, Some(&stale)).await.unwrap_err();

    assert!(matches!(err, Error::ConfirmationMissing(id) if id == plan_id));
    assert!(executor.reporter().events.is_empty());
}

#[tokio::test]
async fn refused_plan_releases_no_claims() {
    // The gate fires before targets are claimed, so a later valid run of
    // the same devices is not blocked.
    let plan = raid_plan();
    let mut executor = PrivilegedExecutor::new(offline_settings(), RecordingReporter::new());
    let _ = executor.execute(plan, None).await.unwrap_err();

    assert!(!blocksmith::inventory::is_claimed("/dev/sdb"));
    assert!(!blocksmith::inventory::is_claimed("/dev/sdc"));
    assert!(!blocksmith::inventory::is_claimed("/dev/md0"));
}
