//! Shutdown signals every descendant of the test process, so this file holds
//! a single test and runs in its own binary.

use shardmesh::supervisor::{ExitReport, SHUTDOWN_BANNER};
use shardmesh::{ClusterConfig, ClusterError, GenerateOptions, LaunchOptions, ProgramSpec, Supervisor};
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

fn shell(script: &str) -> ProgramSpec {
    // the generated flags land in $0, $1, ... and are ignored
    ProgramSpec::new("sh").arg("-c").arg(script)
}

fn unprompted(reports: &[ExitReport]) -> Vec<&str> {
    reports
        .iter()
        .filter(|report| report.unprompted)
        .map(|report| report.label.as_str())
        .collect()
}

#[tokio::test]
async fn test_member_exit_and_operator_shutdown_stop_everyone() {
    assert!(!SHUTDOWN_BANNER.is_empty());
    let dir = tempdir().unwrap();
    let config = ClusterConfig::generate(&GenerateOptions::new(2)).unwrap();
    let config_path = dir.path().join("cluster.json");
    config.save(&config_path).unwrap();

    // a master that dies on its own takes the slaves down with it
    let options = LaunchOptions::new(shell("echo master up; sleep 0.3; exit 3"), shell("sleep 30"))
        .cluster_id("T_");
    let mut supervisor = Supervisor::new(config.clone(), config_path.clone(), options);
    let err = timeout(Duration::from_secs(10), supervisor.run())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        ClusterError::ProcessExit { label, status } => {
            assert_eq!(label, "T_MASTER");
            assert!(status.contains('3'));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(supervisor.shutdown_signal().is_initiated());
    assert!(!supervisor.shutdown());

    // operator shutdown: nobody exits unprompted
    let options = LaunchOptions::new(shell("sleep 30"), shell("sleep 30"));
    let mut supervisor = Supervisor::new(config, config_path, options);
    supervisor.launch().await.unwrap();
    assert_eq!(supervisor.processes().len(), 3);
    let labels: Vec<&str> = supervisor.processes().iter().map(|p| p.label.as_str()).collect();
    assert_eq!(labels, vec!["MASTER", "SLAVE_S0", "SLAVE_S1"]);

    let signal = supervisor.shutdown_signal();
    let stopper = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        signal.trigger("test shutdown")
    });
    let reports = timeout(Duration::from_secs(10), supervisor.supervise_all())
        .await
        .unwrap();
    assert!(stopper.await.unwrap());
    assert_eq!(reports.len(), 3);
    assert!(unprompted(&reports).is_empty());
    assert!(reports.iter().all(|report| !report.success));
    assert!(!supervisor.shutdown());
}
