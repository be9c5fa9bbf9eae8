//! Process spawn, signal, and exit-notification scenarios.

use std::cell::Cell;
use std::rc::Rc;

use uvio::{Error, Loop, Process, ProcessOptions, Signum, StdioRedirect};

#[test]
fn spawn_true_exits_zero_and_handle_closes() {
    let lp = Loop::new().expect("loop creation failed");

    let exits = Rc::new(Cell::new(0u32));
    let code = Rc::new(Cell::new(-1i32));
    let child = {
        let exits = exits.clone();
        let code = code.clone();
        Process::spawn(&lp, ProcessOptions::new("/bin/true"), move |status| {
            exits.set(exits.get() + 1);
            code.set(status.exit_code);
            assert_eq!(status.term_signal, 0);
        })
        .expect("spawn failed")
    };

    // 1. The pid is valid immediately after spawn.
    assert!(child.id() > 0);

    // 2. Running the loop delivers the exit exactly once.
    lp.run().expect("run failed");
    assert_eq!(exits.get(), 1);
    assert_eq!(code.get(), 0);

    // 3. The handle closed itself after the exit notification.
    assert!(!child.is_active());
    assert_eq!(child.id(), -1);
    assert!(matches!(child.kill(Signum::Term), Err(Error::HandleDisposed)));
    assert_eq!(lp.handle_count(), 0);
}

#[test]
fn spawn_nonexistent_fails_synchronously_without_leaking() {
    let lp = Loop::new().expect("loop creation failed");

    let err = Process::spawn(
        &lp,
        ProcessOptions::new("/nonexistent/definitely-not-here"),
        |_status| panic!("exit callback must not fire for a failed spawn"),
    )
    .expect_err("spawn of a missing executable should fail");

    assert!(matches!(err, Error::Spawn(_)));
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert_eq!(lp.handle_count(), 0, "no handle may leak on spawn failure");

    // The loop has nothing to wait for.
    lp.run().expect("run failed");
}

#[test]
fn spawn_empty_executable_is_an_argument_error() {
    let lp = Loop::new().expect("loop creation failed");
    let err = Process::spawn(&lp, ProcessOptions::new(""), |_| {})
        .expect_err("empty executable should be rejected");
    assert!(matches!(err, Error::Argument(_)));
}

#[test]
fn exit_code_is_reported() {
    let lp = Loop::new().expect("loop creation failed");

    let mut options = ProcessOptions::new("/bin/sh");
    options.args = vec!["-c".into(), "exit 7".into()];

    let code = Rc::new(Cell::new(-1i32));
    {
        let code = code.clone();
        Process::spawn(&lp, options, move |status| {
            code.set(status.exit_code);
        })
        .expect("spawn failed");
    }

    lp.run().expect("run failed");
    assert_eq!(code.get(), 7);
}

#[test]
fn kill_delivers_term_signal() {
    let lp = Loop::new().expect("loop creation failed");

    let mut options = ProcessOptions::new("/bin/sleep");
    options.args = vec!["5".into()];

    let signal = Rc::new(Cell::new(0i32));
    let child = {
        let signal = signal.clone();
        Process::spawn(&lp, options, move |status| {
            signal.set(status.term_signal);
        })
        .expect("spawn failed")
    };

    // Kill does not wait; termination arrives via the exit callback.
    child.kill(Signum::Term).expect("kill failed");
    lp.run().expect("run failed");
    assert_eq!(signal.get(), libc::SIGTERM);
    assert_eq!(child.id(), -1);
}

#[test]
fn kill_accepts_raw_signal_numbers() {
    let lp = Loop::new().expect("loop creation failed");

    let mut options = ProcessOptions::new("/bin/sleep");
    options.args = vec!["5".into()];

    let child = Process::spawn(&lp, options, |_status| {}).expect("spawn failed");

    // Signal 0 probes liveness without delivering anything.
    child.kill(0).expect("liveness probe failed");
    child.kill(Signum::Kill).expect("kill failed");
    lp.run().expect("run failed");
}

#[test]
fn closed_process_handle_stops_exit_notification() {
    let lp = Loop::new().expect("loop creation failed");

    let mut options = ProcessOptions::new("/bin/sh");
    options.args = vec!["-c".into(), "exit 0".into()];

    let child = Process::spawn(&lp, options, |_status| {
        panic!("exit callback must not fire after close");
    })
    .expect("spawn failed");

    child.close();
    assert_eq!(child.id(), -1);
    lp.run().expect("run failed");
}

#[test]
fn spawn_with_redirected_stdio_and_detached_session() {
    let lp = Loop::new().expect("loop creation failed");

    let mut options = ProcessOptions::new("/bin/true");
    options.detached = true;
    options.stdio = vec![
        StdioRedirect::Ignore,
        StdioRedirect::Ignore,
        StdioRedirect::Inherit,
    ];

    let exited = Rc::new(Cell::new(false));
    {
        let exited = exited.clone();
        Process::spawn(&lp, options, move |status| {
            assert_eq!(status.exit_code, 0);
            exited.set(true);
        })
        .expect("spawn failed");
    }

    lp.run().expect("run failed");
    assert!(exited.get());
}

#[test]
fn process_wide_title_round_trips() {
    Process::set_title("uvio-test").expect("set_title failed");
    let title = Process::title().expect("title query failed");
    assert_eq!(title, "uvio-test");
}

#[test]
fn set_title_truncates_like_the_kernel() {
    Process::set_title("a-title-well-beyond-fifteen-bytes").expect("set_title failed");
    let title = Process::title().expect("title query failed");
    assert_eq!(title.len(), 15);
}

#[test]
fn executable_path_points_at_this_binary() {
    let path = Process::executable_path().expect("executable_path failed");
    assert!(path.is_absolute());
    assert!(path.exists(), "reported executable path should exist");
}
