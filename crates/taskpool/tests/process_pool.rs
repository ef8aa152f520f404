//! End-to-end tests over real child processes.
//!
//! The demo binary doubles as manager and worker, so these spawn it with the
//! role in its environment exactly as a host application would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use taskpool::{
    CommandSpawner, FaultKind, ManagerConfig, ManagerProxy, StagedTask, Status, TaskCallback,
    TaskFault, TaskMethod, TaskSpec, Verb,
};

const WAIT: Duration = Duration::from_secs(30);

fn start(name: &str) -> ManagerProxy {
    let config = ManagerConfig::new(name)
        .with_pool_size(2)
        .with_request_timeout(Duration::from_secs(2));
    let spawner = CommandSpawner::new(env!("CARGO_BIN_EXE_taskpool-demo"));
    ManagerProxy::start(config, Arc::new(spawner)).expect("manager should start")
}

fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + Clone + 'static) {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&values);
    (values, move |value| sink.lock().unwrap().push(value))
}

#[test]
fn increment_round_trip() {
    let mut proxy = start("increment");
    let (values, record) = collector::<Value>();

    proxy
        .schedule_task(TaskCallback::new(TaskSpec::new("increment", json!(0)), record))
        .unwrap();

    assert!(proxy.wait_idle(WAIT));
    assert_eq!(*values.lock().unwrap(), vec![json!(1)]);
    proxy.terminate();
    assert!(!proxy.is_alive());
}

#[test]
fn dependent_receives_prerequisite_value() {
    let mut proxy = start("chain");
    let (values, record) = collector::<(&'static str, Value)>();
    let first = record.clone();

    proxy
        .schedule_tasks([
            (
                "task1",
                StagedTask::new(TaskCallback::new(TaskSpec::new("constant", json!(2)), move |v| {
                    first(("task1", v))
                })),
            ),
            (
                "task2",
                StagedTask::new(TaskCallback::new(TaskSpec::new("increment", Value::Null), move |v| {
                    record(("task2", v))
                }))
                .after(["task1"]),
            ),
        ])
        .unwrap();

    assert!(proxy.wait_idle(WAIT));
    let mut got = values.lock().unwrap().clone();
    got.sort_by_key(|(name, _)| *name);
    assert_eq!(got, vec![("task1", json!(2)), ("task2", json!(3))]);
    proxy.terminate();
}

#[test]
fn faults_and_cascades_reach_handlers() {
    let mut proxy = start("faults");
    let (faults, record) = collector::<(&'static str, FaultKind)>();
    let on_root = record.clone();
    let on_child = record.clone();
    let on_panic = record;

    proxy
        .schedule_tasks([
            (
                "root",
                StagedTask::new(
                    TaskCallback::new(TaskSpec::new("fail", json!("nope")), |_| {})
                        .with_fault_handler(move |f: TaskFault| on_root(("root", f.kind))),
                ),
            ),
            (
                "child",
                StagedTask::new(
                    TaskCallback::new(TaskSpec::new("increment", Value::Null), |_| {})
                        .with_fault_handler(move |f: TaskFault| on_child(("child", f.kind))),
                )
                .after(["root"]),
            ),
            (
                "panics",
                StagedTask::new(
                    TaskCallback::new(TaskSpec::new("panic", Value::Null), |_| {})
                        .with_fault_handler(move |f: TaskFault| on_panic(("panics", f.kind))),
                ),
            ),
        ])
        .unwrap();

    assert!(proxy.wait_idle(WAIT));
    let mut got = faults.lock().unwrap().clone();
    got.sort_by_key(|(name, _)| *name);
    assert_eq!(
        got,
        vec![
            ("child", FaultKind::PrerequisiteFailed),
            ("panics", FaultKind::Panicked),
            ("root", FaultKind::Raised),
        ]
    );

    // The pool survives faulting tasks.
    assert_eq!(proxy.make_request(Verb::GetStatus, None).unwrap(), Status::Running);
    proxy.terminate();
}

#[test]
fn join_then_more_work() {
    let mut proxy = start("join");
    let (values, record) = collector::<Value>();
    let sleep = TaskMethod::new("sleep").returning(record);

    for ms in [30, 10, 20] {
        sleep.call(&mut proxy, json!(ms)).unwrap();
    }
    assert!(proxy.join(WAIT));
    sleep.call(&mut proxy, json!(5)).unwrap();

    assert!(proxy.wait_idle(WAIT));
    let mut got: Vec<u64> = values.lock().unwrap().iter().filter_map(Value::as_u64).collect();
    got.sort_unstable();
    assert_eq!(got, vec![5, 10, 20, 30]);
    proxy.terminate();
}

#[test]
fn killed_manager_stops_answering() {
    let mut proxy = start("kill");
    assert!(proxy.is_alive());

    proxy.kill();
    assert!(!proxy.is_alive());
    assert!(proxy.make_request(Verb::GetStatus, Some(Duration::from_millis(200))).is_err());
}
