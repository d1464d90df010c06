//! End-to-end tests: a real spawner on its own thread, the broker server on
//! the test thread, and callers and workers talking to it from client threads.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use launcher_rs::{
    ActivationPolicy, BrokerConfig, BrokerServer, CallerReply, CallerRequest, LauncherError,
    LoopControl, ResolvedCommand, ServerConfig, SpawnerConfig, SpawnerState, StreamLink,
};

static DAEMON_TEST_LOCK: Mutex<()> = Mutex::new(());

struct SpawnerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SpawnerThread {
    fn start(dir: &Path) -> (Self, StreamLink) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let socket = dir.join("spawner");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let config = SpawnerConfig::new(socket).probe_grace(Duration::ZERO);
            let mut spawner = SpawnerState::new(config).unwrap();
            spawner.attach_broker(theirs, None);
            while !flag.load(Ordering::SeqCst) {
                match spawner.poll_once(Some(Duration::from_millis(20))) {
                    Ok(LoopControl::Continue) => {}
                    Ok(LoopControl::Finished) | Err(_) => break,
                }
            }
        });
        (Self { stop, handle }, StreamLink::new(ours))
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap();
    }
}

fn server(dir: &Path, broker: BrokerConfig) -> (BrokerServer<StreamLink>, SpawnerThread) {
    let (spawner, link) = SpawnerThread::start(dir);
    let config = ServerConfig::in_dir(dir).broker(broker);
    (BrokerServer::new(config, link).unwrap(), spawner)
}

fn drive<T>(
    server: &mut BrokerServer<StreamLink>,
    client: impl FnOnce() -> T + Send + 'static,
) -> T
where
    T: Send + 'static,
{
    let handle = thread::spawn(client);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "client did not finish in time");
        server.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    handle.join().unwrap()
}

fn send(path: &Path, request: &CallerRequest) -> UnixStream {
    let mut stream = UnixStream::connect(path).unwrap();
    let mut line = serde_json::to_vec(request).unwrap();
    line.push(b'\n');
    stream.write_all(&line).unwrap();
    stream
}

fn reply(stream: &UnixStream) -> CallerReply {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

fn call(path: &Path, request: &CallerRequest) -> CallerReply {
    reply(&send(path, request))
}

fn exec(program: &str, args: &[&str], wait: bool) -> CallerRequest {
    CallerRequest::Exec {
        program: program.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        cwd: String::new(),
        env: vec![],
        startup_token: String::new(),
        wait,
    }
}

#[test]
fn exec_reports_the_pid() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let answer = drive(&mut server, move || call(&path, &exec("echo", &["hi"], false)));

    match answer {
        CallerReply::Outcome(outcome) => {
            assert_eq!(outcome.result, 0);
            assert!(outcome.pid > 0);
            assert_eq!(outcome.error, "");
        }
        other => panic!("unexpected reply {:?}", other),
    }
    drop(server);
    spawner.stop();
}

#[test]
fn waited_exec_answers_after_exit() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let (answer, elapsed) = drive(&mut server, move || {
        let started = Instant::now();
        let answer = call(&path, &exec("/bin/sh", &["-c", "sleep 0.3; exit 3"], true));
        (answer, started.elapsed())
    });

    let CallerReply::Outcome(outcome) = answer else {
        panic!("unexpected reply {:?}", answer);
    };
    assert_eq!(outcome.result, 0);
    assert!(outcome.pid > 0);
    assert!(elapsed >= Duration::from_millis(300));
    assert_eq!(server.broker().in_flight(), 0);
    drop(server);
    spawner.stop();
}

#[test]
fn missing_program_is_reported() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let answer = drive(&mut server, move || {
        call(&path, &exec("/nonexistent/program", &[], false))
    });

    let CallerReply::Outcome(outcome) = answer else {
        panic!("unexpected reply {:?}", answer);
    };
    assert_eq!(outcome.result, 1);
    assert_eq!(outcome.pid, 0);
    assert!(
        outcome
            .error
            .starts_with("could not launch '/nonexistent/program':\nexec failed"),
        "{}",
        outcome.error
    );
    drop(server);
    spawner.stop();
}

#[test]
fn service_registration_completes_the_launch() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let answer = drive(&mut server, move || {
        let launching = send(
            &path,
            &CallerRequest::StartService {
                command: ResolvedCommand {
                    activation: ActivationPolicy::Multi,
                    ..ResolvedCommand::new("/bin/sleep", vec!["1".into()])
                },
                urls: vec![],
                env: vec![],
                startup_token: String::new(),
                blind: false,
            },
        );
        // Let the launch go out before the registration shows up
        thread::sleep(Duration::from_millis(200));
        let registered = call(
            &path,
            &CallerRequest::ServiceRegistered {
                name: "org.example.sleep-77".into(),
                owner: ":1.77".into(),
            },
        );
        assert_eq!(registered, CallerReply::Done);
        reply(&launching)
    });

    let CallerReply::Outcome(outcome) = answer else {
        panic!("unexpected reply {:?}", answer);
    };
    assert_eq!(outcome.result, 0);
    assert_eq!(outcome.service_name, "org.example.sleep-77");
    drop(server);
    spawner.stop();
}

#[test]
fn idle_worker_is_handed_to_the_caller() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let callers = server.caller_socket().to_path_buf();
    let workers = server.worker_socket().to_path_buf();

    let (answer, command) = drive(&mut server, move || {
        let mut worker = UnixStream::connect(&workers).unwrap();
        worker.write_all(b"IDLE 4242 http\n").unwrap();
        thread::sleep(Duration::from_millis(200));

        let answer = call(
            &callers,
            &CallerRequest::RequestWorker {
                protocol: "http".into(),
                host: String::new(),
                app_socket: "/run/app.sock".into(),
            },
        );
        let mut command = String::new();
        BufReader::new(&worker).read_line(&mut command).unwrap();
        (answer, command)
    });

    assert_eq!(answer, CallerReply::Worker { pid: 4242 });
    assert_eq!(command, "CONNECT /run/app.sock\n");
    assert_eq!(server.broker().idle_workers(), 0);
    drop(server);
    spawner.stop();
}

#[test]
fn stale_worker_is_disconnected_by_the_sweep() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig::default()
        .worker_max_idle(Duration::ZERO)
        .sweep_interval(Duration::from_secs(1));
    let (mut server, spawner) = server(dir.path(), config);
    let workers = server.worker_socket().to_path_buf();
    assert!(server.sweep_due().is_none());

    let rest = drive(&mut server, move || {
        let mut worker = UnixStream::connect(&workers).unwrap();
        worker.write_all(b"IDLE 4243 ftp\n").unwrap();
        let mut rest = Vec::new();
        worker.read_to_end(&mut rest).unwrap();
        rest
    });

    assert!(rest.is_empty());
    assert_eq!(server.broker().idle_workers(), 0);
    assert!(server.sweep_due().is_none());
    drop(server);
    spawner.stop();
}

#[test]
fn terminate_stops_both_loops() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();
    let worker_path: PathBuf = server.worker_socket().to_path_buf();

    let answer = drive(&mut server, {
        let path = path.clone();
        move || call(&path, &CallerRequest::Terminate)
    });
    assert_eq!(answer, CallerReply::Done);
    assert_eq!(
        server.poll_once(Some(Duration::ZERO)).unwrap(),
        LoopControl::Finished
    );

    drop(server);
    assert!(!path.exists());
    assert!(!worker_path.exists());
    // The spawner saw TERMINATE and has nothing left to wait for
    spawner.handle.join().unwrap();
}

#[test]
fn bad_request_gets_a_failure_reply() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let answer = drive(&mut server, move || {
        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"{\"op\":\"format_disk\"}\n").unwrap();
        reply(&stream)
    });

    assert!(matches!(answer, CallerReply::Failed { .. }));
    drop(server);
    spawner.stop();
}

#[test]
fn unlaunchable_requests_do_not_stop_the_server() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (mut server, spawner) = server(dir.path(), BrokerConfig::default());
    let path = server.caller_socket().to_path_buf();

    let (empty, bad_env, good) = drive(&mut server, move || {
        let empty = call(&path, &exec("", &[], false));
        let bad_env = call(
            &path,
            &CallerRequest::SetEnv {
                name: "A=B".into(),
                value: "x".into(),
            },
        );
        let good = call(&path, &exec("/bin/true", &[], true));
        (empty, bad_env, good)
    });

    let CallerReply::Outcome(empty) = empty else {
        panic!("unexpected reply {:?}", empty);
    };
    assert_eq!(empty.result, 1);
    assert_eq!(empty.error, "could not launch '':\nempty program name");
    assert!(matches!(bad_env, CallerReply::Failed { .. }));
    let CallerReply::Outcome(good) = good else {
        panic!("unexpected reply {:?}", good);
    };
    assert_eq!(good.result, 0);
    assert_eq!(
        server.poll_once(Some(Duration::ZERO)).unwrap(),
        LoopControl::Continue
    );
    drop(server);
    spawner.stop();
}

#[test]
fn lost_spawner_link_ends_the_server() {
    let _lock = DAEMON_TEST_LOCK.lock();
    let dir = tempfile::tempdir().unwrap();
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mut server =
        BrokerServer::new(ServerConfig::in_dir(dir.path()), StreamLink::new(ours)).unwrap();
    drop(theirs);

    let mut outcome = Ok(LoopControl::Continue);
    for _ in 0..50 {
        outcome = server.poll_once(Some(Duration::from_millis(20)));
        if outcome.is_err() {
            break;
        }
    }
    assert!(matches!(outcome, Err(LauncherError::ChannelClosed)));
}
