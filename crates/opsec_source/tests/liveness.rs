mod common;

#[cfg(unix)]
mod unix {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use opsec_source::{
        line_queue, LifecycleState, LogGrabberProcess, OpsecError, OpsecSource, PollStatus,
        TracingErrorLog,
    };

    use super::common::{config, config_dir, next_outcome, wait_for, write_script, Delivered};

    #[tokio::test]
    async fn deliberate_stop_is_not_a_fault() {
        let dir = config_dir();
        let mut source = OpsecSource::builder(config(&dir))
            .binary("/bin/sleep")
            .arg("30")
            .build(Delivered::default().sink())
            .expect("build source");

        source.start().expect("start");
        assert_eq!(source.lifecycle(), LifecycleState::Running);
        assert_eq!(source.process().unwrap(), PollStatus::Backoff);

        source.stop().await.expect("stop");
        assert_eq!(source.lifecycle(), LifecycleState::Stopped);
        assert_eq!(source.process().unwrap(), PollStatus::Backoff);

        source.stop().await.expect("second stop is a no-op");
        assert_eq!(source.process().unwrap(), PollStatus::Backoff);
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported_on_every_check() {
        let dir = config_dir();
        let script = write_script(dir.path(), "dies", "#!/bin/sh\nexit 3\n");
        let mut source = OpsecSource::builder(config(&dir))
            .binary(&script)
            .build(Delivered::default().sink())
            .expect("build source");

        source.start().expect("start");
        for _ in 0..2 {
            match next_outcome(&mut source).await {
                Err(OpsecError::UnexpectedTermination { binary, status }) => {
                    assert_eq!(binary, script);
                    assert_eq!(status.code(), Some(3));
                }
                other => panic!("expected termination fault, got {other:?}"),
            }
        }

        source.stop().await.expect("stop after exit");
        assert_eq!(source.process().unwrap(), PollStatus::Backoff);
    }

    #[tokio::test]
    async fn missing_binary_is_a_fatal_launch_fault() {
        let dir = config_dir();
        let mut source = OpsecSource::builder(config(&dir))
            .binary(dir.path().join("no-such-loggrabber"))
            .build(Delivered::default().sink())
            .expect("build source");

        let err = source.start().unwrap_err();
        assert!(matches!(err, OpsecError::Spawn { .. }), "{err:?}");
        assert!(err.is_fatal());
        assert_eq!(source.lifecycle(), LifecycleState::NotStarted);

        source.stop().await.expect("stop without start");
        assert_eq!(source.lifecycle(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn process_is_never_started_twice() {
        let dir = config_dir();
        let (tx, _rx) = line_queue();
        let mut process = LogGrabberProcess::new(
            "/bin/sleep",
            vec!["30".to_string()],
            config(&dir).validate().unwrap(),
        );
        assert!(matches!(process.check_terminated(), Err(OpsecError::NotStarted)));

        process
            .start(tx.clone(), Arc::new(TracingErrorLog))
            .expect("start");
        assert!(process.id().is_some());
        assert!(matches!(
            process.start(tx, Arc::new(TracingErrorLog)),
            Err(OpsecError::AlreadyStarted)
        ));

        process.stop().await.expect("stop");
        assert!(process.id().is_none());
        assert!(process.check_terminated().is_ok());
    }

    #[tokio::test]
    async fn stop_kills_a_process_that_ignores_sigterm() {
        let dir = config_dir();
        let script = write_script(
            dir.path(),
            "stubborn",
            "#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n",
        );
        let (tx, _rx) = line_queue();
        let mut process =
            LogGrabberProcess::new(&script, Vec::new(), config(&dir).validate().unwrap());
        process
            .start(tx, Arc::new(TracingErrorLog))
            .expect("start");
        assert!(process.check_terminated().is_ok());

        tokio::time::timeout(Duration::from_secs(5), process.stop())
            .await
            .expect("stop returns")
            .expect("stop");
        assert_eq!(process.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn exit_is_reported_while_a_descendant_holds_stdout_open() {
        let dir = config_dir();
        let script = write_script(
            dir.path(),
            "forks",
            "#!/bin/sh\necho a=1\nsleep 20 &\nexit 7\n",
        );
        let delivered = Delivered::default();
        let mut source = OpsecSource::builder(config(&dir))
            .binary(&script)
            .backoff(Duration::from_millis(10))
            .build(delivered.sink())
            .expect("build source");

        source.start().expect("start");
        assert_eq!(next_outcome(&mut source).await.unwrap(), PollStatus::Ready);

        let started = Instant::now();
        match next_outcome(&mut source).await {
            Err(OpsecError::UnexpectedTermination { status, .. }) => {
                assert_eq!(status.code(), Some(7));
            }
            other => panic!("expected termination fault, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(delivered.json(), vec![serde_json::json!({"a": "1"})]);

        source.stop().await.expect("stop after exit");
        assert_eq!(source.process().unwrap(), PollStatus::Backoff);
    }

    #[tokio::test]
    async fn drain_grace_bounds_the_wait_for_stdout() {
        let dir = config_dir();
        let script = write_script(dir.path(), "forks", "#!/bin/sh\nsleep 20 &\nexit 0\n");
        let (tx, _rx) = line_queue();
        let mut process =
            LogGrabberProcess::new(&script, Vec::new(), config(&dir).validate().unwrap())
                .with_drain_grace(Duration::from_millis(50));
        process
            .start(tx, Arc::new(TracingErrorLog))
            .expect("start");

        let reported = wait_for(|| {
            matches!(
                process.check_terminated(),
                Err(OpsecError::UnexpectedTermination { .. })
            )
        });
        assert!(reported.await);
        process.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn exit_is_held_back_until_stdout_is_drained() {
        let dir = config_dir();
        let script = write_script(
            dir.path(),
            "burst",
            "#!/bin/sh\ni=0\nwhile [ $i -lt 200 ]; do echo \"seq=$i\"; i=$((i+1)); done\n",
        );
        let delivered = Delivered::default();
        let mut source = OpsecSource::builder(config(&dir))
            .binary(&script)
            .build(delivered.sink())
            .expect("build source");

        source.start().expect("start");
        // Let the child exit before anything is consumed.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut seen = 0;
        loop {
            match next_outcome(&mut source).await {
                Ok(PollStatus::Ready) => seen += 1,
                Ok(PollStatus::Backoff) => panic!("deadline passed"),
                Err(OpsecError::UnexpectedTermination { .. }) => break,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(seen, 200);

        let records = delivered.json();
        for (n, record) in records.iter().enumerate() {
            assert_eq!(record["seq"], n.to_string());
        }
    }
}
