use std::time::{Duration, Instant};

use dx_exp::testing::{MockBehavior, MockTransport};
use dx_exp::{
    CommandFanout, CommandLog, CommandStatus, FailureLatch, RemoteTarget, ServerSpec, Transport,
};

fn connect_all(transport: &dyn Transport, count: usize) -> Vec<Box<dyn RemoteTarget>> {
    (0..count)
        .map(|idx| {
            let server = ServerSpec::new(format!("n{}", idx + 1), format!("10.0.0.{}", idx + 1))
                .with_meta("ib_ip", format!("192.168.0.{}", idx + 1));
            transport.connect(&server, idx).expect("connect")
        })
        .collect()
}

#[test]
fn one_pending_command_per_target_with_own_status() {
    let transport = MockTransport::new()
        .with_behavior("n1", MockBehavior::Exit(0))
        .with_behavior("n2", MockBehavior::Exit(3))
        .with_behavior("n3", MockBehavior::Delay(Duration::from_millis(30), 0));
    let mut targets = connect_all(&transport, 3);
    let fanout = CommandFanout::new().run_on_all(&mut targets, |info| {
        format!("ycsb --nodeId {} --ip {}", info.index, info.meta("ib_ip").unwrap_or("?"))
    });
    assert_eq!(fanout.len(), 3);

    let mut commands: Vec<_> = fanout.into_iter().collect();
    // Waiting out of launch order must not mix statuses up.
    assert_eq!(commands[2].wait(), CommandStatus::Exited(0));
    assert_eq!(commands[1].wait(), CommandStatus::Exited(3));
    assert_eq!(commands[0].wait(), CommandStatus::Exited(0));
    assert_eq!(commands[1].wait(), CommandStatus::Exited(3), "status is cached");
    assert_eq!(commands[1].target(), "n2");

    let launched: Vec<_> = transport.launches().into_iter().map(|launch| launch.command).collect();
    assert_eq!(
        launched,
        [
            "ycsb --nodeId 0 --ip 192.168.0.1",
            "ycsb --nodeId 1 --ip 192.168.0.2",
            "ycsb --nodeId 2 --ip 192.168.0.3",
        ]
    );
}

#[test]
fn launch_failure_is_reported_as_data() {
    let transport = MockTransport::new().with_behavior("n2", MockBehavior::FailLaunch("no route".into()));
    let mut targets = connect_all(&transport, 3);
    let latch = std::sync::Arc::new(FailureLatch::default());
    let result = CommandFanout::new()
        .with_latch(latch.clone())
        .run_on_all(&mut targets, |_| "true".to_string())
        .wait_all();
    assert!(!result.all_succeeded());
    // n3 comes after the latch tripped on n2 and is never launched.
    assert_eq!(result.exit_codes(), [Some(0), None, None]);
    let failures: Vec<_> = result.failures().collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].target, "n2");
    assert!(matches!(&failures[0].status, CommandStatus::LaunchFailed(reason) if reason == "no route"));
    assert_eq!(latch.first_failure().map(|failure| failure.target), Some("n2".to_string()));

    let result = CommandFanout::new()
        .run_on_all(&mut targets, |_| "true".to_string())
        .wait_all();
    assert_eq!(result.exit_codes(), [Some(0), None, Some(0)]);
}

#[test]
fn tripped_latch_refuses_later_launches() {
    let transport = MockTransport::new().with_behavior("n1", MockBehavior::Exit(5));
    let mut targets = connect_all(&transport, 2);
    let log = std::sync::Arc::new(CommandLog::default());
    let fanout = CommandFanout::new()
        .with_latch(std::sync::Arc::new(FailureLatch::default()))
        .with_log(log.clone());
    let first = fanout.run_on_all(&mut targets, |_| "make".to_string()).wait_all();
    assert_eq!(first.exit_codes(), [Some(5), Some(0)]);

    let second = fanout.run_on_all(&mut targets, |_| "make install".to_string()).wait_all();
    assert_eq!(transport.launch_count(), 2);
    assert!(second.results.iter().all(|result| matches!(
        &result.status,
        CommandStatus::LaunchFailed(reason) if reason == "not launched: n1 failed earlier (exit 5)"
    )));
    let logged: Vec<_> = log.take().into_iter().map(|result| result.command).collect();
    assert_eq!(logged, ["make", "make", "make install", "make install"]);
    assert!(log.is_empty());
}

#[test]
fn deadline_kills_and_reports_timed_out() {
    let transport = MockTransport::new()
        .with_behavior("n2", MockBehavior::Delay(Duration::from_secs(30), 0));
    let mut targets = connect_all(&transport, 2);
    let started = Instant::now();
    let result = CommandFanout::new()
        .with_timeout(Some(Duration::from_millis(50)))
        .run_on_all(&mut targets, |_| "sleep 30".to_string())
        .wait_all();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.results[0].status, CommandStatus::Exited(0));
    assert_eq!(result.results[1].status, CommandStatus::TimedOut);
}

#[cfg(unix)]
mod local {
    use super::*;
    use dx_exp::LocalTransport;

    #[test]
    fn local_processes_report_real_exit_codes() {
        let transport = LocalTransport::default();
        let mut targets = connect_all(&transport, 3);
        let result = CommandFanout::new()
            .run_on_all(&mut targets, |info| format!("exit {}", info.index))
            .wait_all();
        assert_eq!(result.exit_codes(), [Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn cd_applies_to_later_commands_and_output_is_captured() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let transport = LocalTransport { capture_output: true };
        let mut targets = connect_all(&transport, 1);
        let dir_str = dir.path().to_str().expect("utf8 path");
        targets[0].cd(dir_str);
        let result = CommandFanout::new()
            .run_on_all(&mut targets, |info| format!("echo {} > out.txt && cat out.txt", info.name))
            .wait_all();
        assert!(result.all_succeeded());
        assert_eq!(result.results[0].output.as_deref().map(str::trim), Some("n1"));
        assert!(dir.path().join("out.txt").exists());
    }

    #[test]
    fn local_timeout_kills_sleeping_process() {
        let transport = LocalTransport::default();
        let mut targets = connect_all(&transport, 1);
        let started = Instant::now();
        let result = CommandFanout::new()
            .with_timeout(Some(Duration::from_millis(200)))
            .run_on_all(&mut targets, |_| "sleep 10".to_string())
            .wait_all();
        assert_eq!(result.results[0].status, CommandStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn captured_timeout_kills_the_whole_command() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let transport = LocalTransport { capture_output: true };
        let mut targets = connect_all(&transport, 1);
        targets[0].cd(dir.path().to_str().expect("utf8 path"));
        let started = Instant::now();
        let result = CommandFanout::new()
            .with_timeout(Some(Duration::from_millis(200)))
            .run_on_all(&mut targets, |_| "echo started; sleep 2; touch finished".to_string())
            .wait_all();
        let elapsed = started.elapsed();
        assert_eq!(result.results[0].status, CommandStatus::TimedOut);
        assert!(elapsed < Duration::from_millis(1500), "timeout of 200ms took {elapsed:?}");
        assert_eq!(result.results[0].output.as_deref().map(str::trim), Some("started"));

        // The shell's children die with it.
        std::thread::sleep(Duration::from_millis(2500));
        assert!(!dir.path().join("finished").exists());
    }
}
