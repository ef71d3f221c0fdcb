use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};

use showmap::env::TargetEnv;
use showmap::exec::{ChildSetup, ExecOutcome};
use showmap::forkserver::Forkserver;
use showmap::testcase::Testcase;
use showmap::transform::Native;
use showmap::{Config, RunSignals};
use tracemap::constants::MAP_SIZE;
use tracemap::{ClassifyMode, TraceMap};

const TRACE_ECHO: &str = env!("CARGO_BIN_EXE_trace-echo");

// An abort sticks for the rest of the process, so this lives in its own test binary

#[test]
fn test_companion_lost_during_abort_is_benign() {
    let signals = RunSignals::install().expect("failed to install signal handlers");
    let mut map = TraceMap::create(MAP_SIZE).expect("failed to create map");

    let argv = vec![TRACE_ECHO.to_string()];
    let config = Config::new(argv.clone(), PathBuf::from("-"));
    let env = TargetEnv::prepare(TargetEnv::inherit(), &config, &map, &Native);
    let setup = ChildSetup::new(&argv, &env, 0, false, true).expect("failed to prepare child");
    let testcase = Testcase::stdin().expect("failed to create testcase");

    let mut fsrv = Forkserver::start(&setup, testcase, &mut map, 0, ClassifyMode::Human, signals)
        .expect("fork server did not come up");
    let companion = fsrv.pid();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        // Frozen, the companion can never report the child the abort kills
        kill(companion, Signal::SIGSTOP).unwrap();
        signals.request_abort();
        kill(companion, Signal::SIGKILL).unwrap();
    });

    let mut input = b"hang".to_vec();
    input.extend_from_slice(&[b'x'; 40]);
    let outcome = fsrv
        .run(&mut map, &input)
        .expect("losing the companion during an abort is not an error");
    stopper.join().unwrap();

    assert_eq!(outcome, ExecOutcome::Aborted);
    assert_eq!(map.as_slice()[b'x' as usize], 7);

    // Nothing else is attempted once aborted
    assert_eq!(fsrv.run(&mut map, b"q").unwrap(), ExecOutcome::Aborted);
}
